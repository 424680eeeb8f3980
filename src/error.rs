use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CpuwatchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Telemetry transport unavailable for topic '{topic}': {reason}")]
    TransportUnavailable { topic: String, reason: String },

    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("Supervisor error: {0}")]
    Supervisor(String),

    #[error("Supervisor is already running")]
    SupervisorAlreadyRunning,

    #[error("Parameter store error: {0}")]
    Params(String),

    #[error("Failed to register signal handler: {0}")]
    SignalHandler(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, CpuwatchError>;

/// Which of the two samples of a trial a failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplePoint {
    First,
    Last,
}

impl std::fmt::Display for SamplePoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SamplePoint::First => write!(f, "first"),
            SamplePoint::Last => write!(f, "last"),
        }
    }
}

/// Reasons a whole trial failed before (or instead of) producing a verdict.
///
/// Per-process problems are not listed here; they are carried in the
/// trial report so one bad process never hides the others.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrialFailure {
    #[error("supervisor did not signal readiness within {waited_secs:.1}s")]
    ReadinessTimeout { waited_secs: f64 },

    #[error("supervisor exited before signaling readiness (status: {status})")]
    SupervisorExited { status: String },

    #[error("no telemetry received for the {sample} sample")]
    NoTelemetryReceived { sample: SamplePoint },

    #[error("snapshots are not ordered in time (dt = {dt_secs:.3}s)")]
    InvalidInterval { dt_secs: f64 },

    #[error("telemetry transport failed: {reason}")]
    Transport { reason: String },

    #[error("supervisor failed: {reason}")]
    Supervisor { reason: String },

    #[error("interrupted")]
    Interrupted,
}
