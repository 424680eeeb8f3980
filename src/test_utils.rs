//! Test doubles shared across modules.
//!
//! - [`MemoryParamStore`] - in-memory parameter store
//! - [`FakeLauncher`] - supervisor that can write the readiness key itself
//! - [`ScriptedTransport`] - telemetry source replaying fixed snapshots

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::{CpuwatchError, Result};
use crate::params::ParamStore;
use crate::snapshot::ProcessSnapshot;
use crate::supervisor::{Launcher, SupervisedProcess};
use crate::telemetry::{SubscribeOptions, Subscription, Transport};

#[derive(Default)]
pub struct MemoryParamStore {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl ParamStore for MemoryParamStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.values.lock().unwrap().remove(key);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeCounters {
    launches: AtomicUsize,
    terminates: AtomicUsize,
    kills: AtomicUsize,
}

impl FakeCounters {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn terminates(&self) -> usize {
        self.terminates.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

pub struct FakeLauncher {
    params: Arc<dyn ParamStore>,
    readiness_key: String,
    ready_after: Option<Duration>,
    ignore_term: bool,
    counters: Arc<FakeCounters>,
}

impl FakeLauncher {
    /// A supervisor that never becomes ready on its own.
    pub fn new(params: Arc<dyn ParamStore>, readiness_key: &str) -> Self {
        Self {
            params,
            readiness_key: readiness_key.to_string(),
            ready_after: None,
            ignore_term: false,
            counters: Arc::new(FakeCounters::default()),
        }
    }

    /// Writes the readiness key `delay` after each launch.
    pub fn ready_after(mut self, delay: Duration) -> Self {
        self.ready_after = Some(delay);
        self
    }

    /// Children ignore SIGTERM and only exit on kill.
    pub fn ignore_term(mut self) -> Self {
        self.ignore_term = true;
        self
    }

    pub fn counters(&self) -> Arc<FakeCounters> {
        Arc::clone(&self.counters)
    }
}

impl Launcher for FakeLauncher {
    fn launch(&mut self) -> Result<Box<dyn SupervisedProcess>> {
        self.counters.launches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.ready_after {
            let params = Arc::clone(&self.params);
            let key = self.readiness_key.clone();
            thread::spawn(move || {
                thread::sleep(delay);
                let _ = params.put(&key, b"1");
            });
        }
        Ok(Box::new(FakeProcess {
            counters: Arc::clone(&self.counters),
            ignore_term: self.ignore_term,
            exited: None,
        }))
    }
}

struct FakeProcess {
    counters: Arc<FakeCounters>,
    ignore_term: bool,
    exited: Option<ExitStatus>,
}

impl SupervisedProcess for FakeProcess {
    fn id(&self) -> u32 {
        4242
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.counters.terminates.fetch_add(1, Ordering::SeqCst);
        if !self.ignore_term {
            self.exited = Some(ExitStatus::from_raw(libc::SIGTERM));
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.counters.kills.fetch_add(1, Ordering::SeqCst);
        self.exited = Some(ExitStatus::from_raw(libc::SIGKILL));
        Ok(())
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        Ok(self.exited)
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        Ok(self.exited.unwrap_or_else(|| ExitStatus::from_raw(0)))
    }
}

/// Replays a fixed list of snapshots, one per `receive`. Once exhausted,
/// every receive times out immediately.
pub struct ScriptedTransport {
    script: Vec<ProcessSnapshot>,
    unavailable: bool,
    opens: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<ProcessSnapshot>) -> Self {
        Self {
            script,
            unavailable: false,
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn silent() -> Self {
        Self::new(Vec::new())
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::silent()
        }
    }

    pub fn opens(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.opens)
    }
}

impl Transport for ScriptedTransport {
    fn open(&self, topic: &str, _options: SubscribeOptions) -> Result<Box<dyn Subscription>> {
        if self.unavailable {
            return Err(CpuwatchError::TransportUnavailable {
                topic: topic.to_string(),
                reason: "scripted outage".to_string(),
            });
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSubscription {
            queue: self.script.iter().cloned().collect(),
        }))
    }
}

struct ScriptedSubscription {
    queue: VecDeque<ProcessSnapshot>,
}

impl Subscription for ScriptedSubscription {
    fn receive(&mut self, _wait: bool) -> Option<ProcessSnapshot> {
        self.queue.pop_front()
    }
}
