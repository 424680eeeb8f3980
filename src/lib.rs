pub mod analyzer;
pub mod commands;
pub mod config;
pub mod error;
pub mod output;
pub mod params;
pub mod progress;
pub mod runner;
pub mod signal;
pub mod snapshot;
pub mod supervisor;
pub mod telemetry;

#[cfg(test)]
mod test_utils;

pub use analyzer::{evaluate, Baseline, ProcessOutcome, ToleranceBand, TrialOutcome};
pub use config::Config;
pub use error::{CpuwatchError, Result, TrialFailure};
pub use runner::{RunSummary, TrialRunner, TrialSettings};
pub use snapshot::{ProcessSnapshot, ProcessStat};
pub use supervisor::{SupervisorLifecycle, SupervisorState};
