//! Supervisor process lifecycle.
//!
//! `Stopped -> Starting -> Ready -> Stopping -> Stopped`. Starting returns a
//! [`SupervisorGuard`] that stops the child when dropped, so every exit path
//! out of a trial tears the supervisor down.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{CpuwatchError, Result};
use crate::params::ParamStore;
use crate::signal::ShutdownSignal;

/// Poll interval while waiting for the child to exit.
const EXIT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Ready,
    Stopping,
}

/// A running supervisor child.
pub trait SupervisedProcess: Send {
    fn id(&self) -> u32;
    /// Requests a graceful exit (SIGTERM).
    fn terminate(&mut self) -> io::Result<()>;
    /// Forces exit (SIGKILL).
    fn kill(&mut self) -> io::Result<()>;
    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>>;
    fn wait(&mut self) -> io::Result<ExitStatus>;
    /// Kills anything the child left behind in its process group.
    fn kill_remnants(&mut self) {}
}

impl SupervisedProcess for Child {
    fn id(&self) -> u32 {
        Child::id(self)
    }

    fn terminate(&mut self) -> io::Result<()> {
        signal_group(Child::id(self), Signal::SIGTERM)
    }

    fn kill(&mut self) -> io::Result<()> {
        if signal_group(Child::id(self), Signal::SIGKILL).is_ok() {
            return Ok(());
        }
        Child::kill(self)
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        Child::try_wait(self)
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        Child::wait(self)
    }

    fn kill_remnants(&mut self) {
        let pgid = Pid::from_raw(Child::id(self) as i32);
        match signal::killpg(pgid, Signal::SIGKILL) {
            Ok(()) => debug!(pgid = pgid.as_raw(), "killed leftover process group members"),
            Err(Errno::ESRCH) => {}
            Err(e) => debug!(pgid = pgid.as_raw(), error = %e, "process group sweep failed"),
        }
    }
}

/// Signals the process group led by `pid`, falling back to `pid` alone when
/// it does not lead a group.
fn signal_group(pid: u32, sig: Signal) -> io::Result<()> {
    let pid = Pid::from_raw(pid as i32);
    match signal::killpg(pid, sig) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => signal::kill(pid, sig).map_err(io::Error::from),
        Err(e) => Err(io::Error::from(e)),
    }
}

/// Spawns supervisor processes.
pub trait Launcher: Send {
    fn launch(&mut self) -> Result<Box<dyn SupervisedProcess>>;
}

/// Launches the supervisor from a command line.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    inherit_output: bool,
}

impl CommandLauncher {
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| CpuwatchError::Config("supervisor command is empty".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            working_dir: None,
            inherit_output: true,
        })
    }

    pub fn working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    /// When false, the supervisor's stdout and stderr are discarded.
    pub fn inherit_output(mut self, inherit: bool) -> Self {
        self.inherit_output = inherit;
        self
    }
}

impl Launcher for CommandLauncher {
    fn launch(&mut self) -> Result<Box<dyn SupervisedProcess>> {
        let mut command = Command::new(&self.program);
        // Own process group, so teardown reaches every descendant.
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .process_group(0);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        if !self.inherit_output {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let child = command.spawn().map_err(|e| {
            CpuwatchError::Supervisor(format!("failed to spawn '{}': {}", self.program, e))
        })?;
        Ok(Box::new(child))
    }
}

/// Result of waiting for the readiness key.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    Ready { after: Duration },
    TimedOut { waited: Duration },
    /// The supervisor exited before signaling readiness.
    Exited { status: ExitStatus },
    Interrupted,
}

/// How the supervisor went down.
#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    NotRunning,
    AlreadyExited { status: ExitStatus },
    Graceful { status: ExitStatus },
    /// The grace period expired (or SIGTERM failed) and SIGKILL was sent.
    Killed { grace: Duration },
}

impl fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopOutcome::NotRunning => write!(f, "not running"),
            StopOutcome::AlreadyExited { status } => write!(f, "already exited ({})", status),
            StopOutcome::Graceful { status } => write!(f, "stopped gracefully ({})", status),
            StopOutcome::Killed { grace } => {
                write!(f, "killed after {:.1}s grace period", grace.as_secs_f64())
            }
        }
    }
}

pub struct SupervisorLifecycle {
    launcher: Box<dyn Launcher>,
    params: Arc<dyn ParamStore>,
    readiness_key: String,
    state: SupervisorState,
    child: Option<Box<dyn SupervisedProcess>>,
}

impl SupervisorLifecycle {
    pub fn new(
        launcher: Box<dyn Launcher>,
        params: Arc<dyn ParamStore>,
        readiness_key: impl Into<String>,
    ) -> Self {
        Self {
            launcher,
            params,
            readiness_key: readiness_key.into(),
            state: SupervisorState::Stopped,
            child: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }

    pub fn readiness_key(&self) -> &str {
        &self.readiness_key
    }

    /// Removes any readiness signal left over from a previous run.
    pub fn clear_readiness(&self) -> Result<()> {
        self.params.delete(&self.readiness_key)
    }

    /// Clears the readiness key and spawns the supervisor.
    ///
    /// The returned guard stops the supervisor (with `grace`) when dropped.
    pub fn start(&mut self, grace: Duration) -> Result<SupervisorGuard<'_>> {
        if self.state != SupervisorState::Stopped || self.child.is_some() {
            return Err(CpuwatchError::SupervisorAlreadyRunning);
        }
        self.clear_readiness()?;

        let child = self.launcher.launch()?;
        info!(pid = child.id(), "supervisor started");
        self.child = Some(child);
        self.state = SupervisorState::Starting;
        Ok(SupervisorGuard {
            lifecycle: self,
            grace,
        })
    }

    /// Polls the readiness key every `poll` until it appears or `max_wait`
    /// elapses. A timeout is reported, not raised.
    pub fn await_ready(
        &mut self,
        max_wait: Duration,
        poll: Duration,
        shutdown: &ShutdownSignal,
    ) -> Result<Readiness> {
        let start = Instant::now();
        loop {
            if self.params.contains(&self.readiness_key)? {
                let after = start.elapsed();
                info!(key = %self.readiness_key, after_secs = after.as_secs_f64(), "supervisor ready");
                self.state = SupervisorState::Ready;
                return Ok(Readiness::Ready { after });
            }

            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    warn!(%status, "supervisor exited before becoming ready");
                    return Ok(Readiness::Exited { status });
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= max_wait {
                warn!(waited_secs = elapsed.as_secs_f64(), "readiness wait timed out");
                return Ok(Readiness::TimedOut { waited: elapsed });
            }

            debug!(key = %self.readiness_key, elapsed_secs = elapsed.as_secs_f64(), "waiting for readiness");
            if !shutdown.sleep(poll.min(max_wait - elapsed)) {
                return Ok(Readiness::Interrupted);
            }
        }
    }

    /// Sends SIGTERM, waits up to `grace`, then SIGKILLs if still running.
    ///
    /// Always ends in `Stopped`. Calling it with nothing running is a no-op.
    pub fn stop(&mut self, grace: Duration) -> Result<StopOutcome> {
        let Some(mut child) = self.child.take() else {
            self.state = SupervisorState::Stopped;
            return Ok(StopOutcome::NotRunning);
        };

        self.state = SupervisorState::Stopping;
        let outcome = stop_child(child.as_mut(), grace);
        self.state = SupervisorState::Stopped;

        match &outcome {
            Ok(stopped) => info!(pid = child.id(), outcome = %stopped, "supervisor stopped"),
            Err(e) => warn!(pid = child.id(), error = %e, "supervisor teardown failed"),
        }
        outcome
    }
}

fn stop_child(child: &mut dyn SupervisedProcess, grace: Duration) -> Result<StopOutcome> {
    let outcome = escalate(child, grace);
    child.kill_remnants();
    outcome
}

fn escalate(child: &mut dyn SupervisedProcess, grace: Duration) -> Result<StopOutcome> {
    match child.try_wait() {
        Ok(Some(status)) => return Ok(StopOutcome::AlreadyExited { status }),
        Ok(None) => {}
        Err(e) => warn!(
            pid = child.id(),
            error = %e,
            "could not poll supervisor, sending SIGTERM"
        ),
    }

    if let Err(e) = child.terminate() {
        warn!(pid = child.id(), error = %e, "SIGTERM failed, escalating to SIGKILL");
        return force_kill(child, grace);
    }

    match wait_for_exit(child, grace) {
        Some(status) => Ok(StopOutcome::Graceful { status }),
        None => {
            warn!(
                pid = child.id(),
                grace_secs = grace.as_secs_f64(),
                "supervisor ignored SIGTERM, escalating to SIGKILL"
            );
            force_kill(child, grace)
        }
    }
}

/// Polls for exit until `timeout`. Poll errors count as still running.
fn wait_for_exit(child: &mut dyn SupervisedProcess, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(e) => debug!(pid = child.id(), error = %e, "wait failed"),
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        thread::sleep(EXIT_POLL.min(deadline - now));
    }
}

fn force_kill(child: &mut dyn SupervisedProcess, grace: Duration) -> Result<StopOutcome> {
    match child.kill() {
        Ok(()) => {
            // Reap to avoid a zombie.
            child.wait()?;
            Ok(StopOutcome::Killed { grace })
        }
        // InvalidInput means the child was already reaped.
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(StopOutcome::Killed { grace }),
        Err(e) => {
            warn!(pid = child.id(), error = %e, "SIGKILL failed, waiting for exit");
            match wait_for_exit(child, grace) {
                Some(_) => Ok(StopOutcome::Killed { grace }),
                None => Err(CpuwatchError::Supervisor(format!(
                    "failed to kill supervisor {}: {}",
                    child.id(),
                    e
                ))),
            }
        }
    }
}

/// Scoped ownership of a started supervisor.
pub struct SupervisorGuard<'a> {
    lifecycle: &'a mut SupervisorLifecycle,
    grace: Duration,
}

impl SupervisorGuard<'_> {
    pub fn pid(&self) -> Option<u32> {
        self.lifecycle.pid()
    }

    pub fn state(&self) -> SupervisorState {
        self.lifecycle.state()
    }

    pub fn await_ready(
        &mut self,
        max_wait: Duration,
        poll: Duration,
        shutdown: &ShutdownSignal,
    ) -> Result<Readiness> {
        self.lifecycle.await_ready(max_wait, poll, shutdown)
    }

    /// Stops the supervisor now and reports how it went down.
    pub fn stop(mut self) -> Result<StopOutcome> {
        // No child is left afterwards, so the following Drop is a no-op.
        self.lifecycle.stop(self.grace)
    }
}

impl Drop for SupervisorGuard<'_> {
    fn drop(&mut self) {
        if self.lifecycle.child.is_some() {
            let _ = self.lifecycle.stop(self.grace);
        }
    }
}
