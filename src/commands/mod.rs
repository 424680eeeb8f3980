//! CLI command handlers for cpuwatch.
//!
//! # Commands
//!
//! - [`run`] - Run CPU regression trials against the live supervisor
//! - [`evaluate`] - Compare two recorded snapshots offline
//! - [`config`] - Show or initialize the configuration file

mod config;
mod evaluate;
mod run;

pub use config::config_command;
pub use evaluate::{evaluate_command, load_snapshot};
pub use run::{execute_run, run_command, RunOptions};

use crate::config::{validate_config, Config};
use crate::error::{CpuwatchError, Result};

/// Validate a loaded configuration, converting problems into a config error.
fn ensure_valid(config: &Config) -> Result<()> {
    validate_config(config).map_err(|e| CpuwatchError::Config(e.to_string()))
}
