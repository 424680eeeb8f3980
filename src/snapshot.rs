//! Process telemetry value types.
//!
//! A `procLog` message carries a monotonic timestamp plus one record per
//! running process. Messages are decoded into [`ProcessSnapshot`] at the
//! subscription boundary so nothing downstream handles raw JSON.

use serde::{Deserialize, Serialize};

use crate::error::{CpuwatchError, Result};

/// Cumulative CPU counters of one process at a point in time.
///
/// All counters are seconds accumulated since the process started and never
/// decrease for the lifetime of that process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStat {
    #[serde(default)]
    pub pid: i32,
    #[serde(default)]
    pub name: String,
    /// Command-line tokens, used to identify the process.
    pub cmdline: Vec<String>,
    pub cpu_user: f64,
    pub cpu_system: f64,
    pub cpu_children_user: f64,
    pub cpu_children_system: f64,
}

impl ProcessStat {
    /// Total CPU seconds consumed by the process and its reaped children.
    pub fn total_cpu_time(&self) -> f64 {
        self.cpu_user + self.cpu_system + self.cpu_children_user + self.cpu_children_system
    }

    /// Returns true if any command-line token contains `needle`.
    pub fn matches(&self, needle: &str) -> bool {
        self.cmdline.iter().any(|token| token.contains(needle))
    }
}

/// A timestamped set of process records received as one telemetry message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    /// Monotonic timestamp in nanoseconds.
    pub log_mono_time: u64,
    pub procs: Vec<ProcessStat>,
}

/// Wire shape of a `procLog` message.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcLogMessage {
    log_mono_time: u64,
    proc_log: ProcLog,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProcLog {
    #[serde(default)]
    procs: Vec<ProcessStat>,
}

impl ProcessSnapshot {
    pub fn new(log_mono_time: u64, procs: Vec<ProcessStat>) -> Self {
        Self {
            log_mono_time,
            procs,
        }
    }

    /// First process (in message order) whose command line contains `needle`.
    pub fn find(&self, needle: &str) -> Option<&ProcessStat> {
        self.procs.iter().find(|p| p.matches(needle))
    }

    /// Decodes one newline-delimited `procLog` JSON message.
    pub fn from_json_line(line: &str) -> Result<Self> {
        let message: ProcLogMessage = serde_json::from_str(line.trim())
            .map_err(|e| CpuwatchError::InvalidSnapshot(e.to_string()))?;
        Ok(Self {
            log_mono_time: message.log_mono_time,
            procs: message.proc_log.procs,
        })
    }

    /// Encodes the snapshot as a single-line `procLog` JSON message.
    pub fn to_json_line(&self) -> Result<String> {
        let message = ProcLogMessage {
            log_mono_time: self.log_mono_time,
            proc_log: ProcLog {
                procs: self.procs.clone(),
            },
        };
        Ok(serde_json::to_string(&message)?)
    }
}
