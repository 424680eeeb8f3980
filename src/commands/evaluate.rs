//! Evaluate command handler.
//!
//! Runs the analyzer over two recorded snapshots without starting the
//! supervisor. Useful for re-checking captured telemetry against new
//! baselines.

use std::fs;
use std::path::Path;

use crate::analyzer::{evaluate, TrialOutcome};
use crate::config::load_config;
use crate::error::{CpuwatchError, Result};
use crate::output::{print_cpu_report, print_info};
use crate::snapshot::ProcessSnapshot;

use super::ensure_valid;

/// Read a snapshot recorded as JSON (one document per file).
pub fn load_snapshot(path: &Path) -> Result<ProcessSnapshot> {
    let content = fs::read_to_string(path)?;
    ProcessSnapshot::from_json_line(&content).map_err(|e| match e {
        CpuwatchError::InvalidSnapshot(reason) => {
            CpuwatchError::InvalidSnapshot(format!("{}: {}", path.display(), reason))
        }
        other => other,
    })
}

/// Evaluate `first` and `last` against the configured baselines.
///
/// Returns 0 when every baseline is within its band, 1 otherwise.
pub fn evaluate_command(
    first: &Path,
    last: &Path,
    config_path: Option<&Path>,
    report: Option<&Path>,
) -> Result<i32> {
    let config = load_config(config_path)?;
    ensure_valid(&config)?;

    let outcome = evaluate(
        &load_snapshot(first)?,
        &load_snapshot(last)?,
        &config.baselines,
    );
    print_cpu_report(&outcome);

    if let Some(path) = report {
        save_outcome(&outcome, path)?;
        print_info(&format!("Evaluation written to {}", path.display()));
    }
    Ok(if outcome.passed { 0 } else { 1 })
}

fn save_outcome(outcome: &TrialOutcome, path: &Path) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(outcome)?)?;
    Ok(())
}
