//! Local `procLog` publisher reading `/proc`.
//!
//! Stands in for a telemetry bus: a background thread scans every
//! `/proc/<pid>` at a fixed interval and pushes a [`ProcessSnapshot`] into
//! the subscription mailbox.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{
    Mailbox, MailboxSubscription, SubscribeOptions, Subscription, Transport, PROC_LOG_TOPIC,
};
use crate::error::{CpuwatchError, Result};
use crate::snapshot::{ProcessSnapshot, ProcessStat};

#[derive(Debug, Clone)]
pub struct ProcfsTransport {
    proc_root: PathBuf,
    interval: Duration,
}

impl ProcfsTransport {
    pub fn new(proc_root: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            proc_root: proc_root.into(),
            interval,
        }
    }
}

impl Transport for ProcfsTransport {
    fn open(&self, topic: &str, options: SubscribeOptions) -> Result<Box<dyn Subscription>> {
        if topic != PROC_LOG_TOPIC {
            return Err(CpuwatchError::TransportUnavailable {
                topic: topic.to_string(),
                reason: format!("procfs source only publishes {}", PROC_LOG_TOPIC),
            });
        }
        if !self.proc_root.is_dir() {
            return Err(CpuwatchError::TransportUnavailable {
                topic: topic.to_string(),
                reason: format!("{} is not a directory", self.proc_root.display()),
            });
        }

        let sampler = ProcSampler::new(self.proc_root.clone());
        let mailbox = Arc::new(Mailbox::new(options.conflate));
        let producer_box = Arc::clone(&mailbox);
        let interval = self.interval;
        let producer = thread::Builder::new()
            .name("procfs-sampler".to_string())
            .spawn(move || {
                let origin = Instant::now();
                loop {
                    match sampler.sample(origin) {
                        Ok(snapshot) => producer_box.push(snapshot),
                        Err(e) => warn!(error = %e, "procfs scan failed"),
                    }
                    if producer_box.wait_closed(interval) {
                        break;
                    }
                }
            })?;

        debug!(root = %self.proc_root.display(), interval_ms = self.interval.as_millis() as u64, "procfs sampler started");
        Ok(Box::new(MailboxSubscription::new(
            mailbox,
            options.timeout,
            producer,
        )))
    }
}

/// Reads per-process CPU counters from a procfs tree.
pub struct ProcSampler {
    root: PathBuf,
    clock_ticks: f64,
}

impl ProcSampler {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            clock_ticks: clock_ticks_per_sec(),
        }
    }

    /// Sampler with a fixed tick rate, for fake proc trees.
    pub fn with_clock_ticks(root: PathBuf, clock_ticks: u64) -> Self {
        Self {
            root,
            clock_ticks: clock_ticks.max(1) as f64,
        }
    }

    /// Scans every numeric entry under the root, timestamped relative to `origin`.
    pub fn sample(&self, origin: Instant) -> io::Result<ProcessSnapshot> {
        let mut procs = Vec::new();
        for entry in fs::read_dir(&self.root)?.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i32>().ok())
            else {
                continue;
            };
            // Processes routinely exit mid-scan.
            if let Some(stat) = self.read_process(pid, &entry.path()) {
                procs.push(stat);
            }
        }
        procs.sort_by_key(|p| p.pid);
        let log_mono_time = u64::try_from(origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
        Ok(ProcessSnapshot::new(log_mono_time, procs))
    }

    fn read_process(&self, pid: i32, dir: &Path) -> Option<ProcessStat> {
        let stat = fs::read_to_string(dir.join("stat")).ok()?;
        let parsed = parse_stat(&stat)?;
        let cmdline = fs::read(dir.join("cmdline"))
            .map(|raw| parse_cmdline(&raw))
            .unwrap_or_default();

        Some(ProcessStat {
            pid,
            name: parsed.comm,
            cmdline,
            cpu_user: parsed.utime as f64 / self.clock_ticks,
            cpu_system: parsed.stime as f64 / self.clock_ticks,
            cpu_children_user: parsed.cutime as f64 / self.clock_ticks,
            cpu_children_system: parsed.cstime as f64 / self.clock_ticks,
        })
    }
}

fn clock_ticks_per_sec() -> f64 {
    // SAFETY: sysconf only reads a system constant.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

#[derive(Debug, PartialEq)]
struct StatFields {
    comm: String,
    utime: u64,
    stime: u64,
    cutime: u64,
    cstime: u64,
}

/// Parses `/proc/<pid>/stat`. The command name may contain spaces and
/// parentheses, so fields are located after the last `)`.
fn parse_stat(content: &str) -> Option<StatFields> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    let comm = content.get(open + 1..close)?.to_string();
    let fields: Vec<&str> = content.get(close + 1..)?.split_whitespace().collect();
    // fields[0] is the state (field 3); utime is field 14.
    let tick = |field: usize| -> Option<u64> {
        let value: i64 = fields.get(field - 3)?.parse().ok()?;
        Some(value.max(0) as u64)
    };
    Some(StatFields {
        comm,
        utime: tick(14)?,
        stime: tick(15)?,
        cutime: tick(16)?,
        cstime: tick(17)?,
    })
}

fn parse_cmdline(raw: &[u8]) -> Vec<String> {
    raw.split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect()
}
