//! Trial orchestration.
//!
//! One trial: start supervisor -> subscribe -> wait for readiness -> warm up
//! -> sample -> measurement window -> sample -> evaluate -> stop supervisor.
//! Teardown runs on every path out of a trial. Trials run sequentially and
//! the run stops at the first failure.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::analyzer::{evaluate, Baseline, TrialOutcome};
use crate::config::Config;
use crate::error::{Result, SamplePoint, TrialFailure};
use crate::params::{self, ParamStore};
use crate::signal::ShutdownSignal;
use crate::snapshot::ProcessSnapshot;
use crate::supervisor::{Readiness, StopOutcome, SupervisorGuard, SupervisorLifecycle};
use crate::telemetry::{SubscribeOptions, Subscription, Transport};

/// Exit status used when a run is interrupted by Ctrl+C.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Timing and baseline parameters for every trial of a run.
#[derive(Debug, Clone)]
pub struct TrialSettings {
    pub topic: String,
    pub receive_timeout: Duration,
    pub readiness_timeout: Duration,
    pub readiness_poll: Duration,
    pub warm_up: Duration,
    pub window: Duration,
    pub grace_period: Duration,
    pub abort_on_readiness_timeout: bool,
    pub baselines: Vec<Baseline>,
    pub enable_params: BTreeMap<String, String>,
}

impl TrialSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            topic: config.telemetry.topic.clone(),
            receive_timeout: Duration::from_millis(config.telemetry.receive_timeout_ms),
            readiness_timeout: Duration::from_secs(config.timing.readiness_timeout_secs),
            readiness_poll: Duration::from_secs(config.timing.readiness_poll_secs),
            warm_up: Duration::from_secs(config.timing.warm_up_secs),
            window: Duration::from_secs(config.timing.window_secs),
            grace_period: Duration::from_secs(config.supervisor.grace_period_secs),
            abort_on_readiness_timeout: config.timing.abort_on_readiness_timeout,
            baselines: config.baselines.clone(),
            enable_params: config.params.enable.clone(),
        }
    }
}

impl Default for TrialSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Progress notifications emitted while a run executes.
#[derive(Debug)]
pub enum RunEvent<'a> {
    TrialStarted { index: usize, total: usize },
    SupervisorStarted { pid: Option<u32> },
    WaitingForReadiness { timeout: Duration },
    Readiness(Readiness),
    WarmingUp(Duration),
    Sampled { sample: SamplePoint, log_mono_time: u64 },
    Measuring(Duration),
    SupervisorStopped(StopOutcome),
    TrialFinished(&'a TrialRecord),
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialRecord {
    pub index: usize,
    pub duration_secs: f64,
    pub outcome: TrialOutcome,
}

/// Everything a run produced, in trial order.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub planned_trials: usize,
    pub trials: Vec<TrialRecord>,
}

impl RunSummary {
    pub fn new(planned_trials: usize) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            planned_trials,
            trials: Vec::new(),
        }
    }

    /// True only if every planned trial ran and passed.
    pub fn passed(&self) -> bool {
        self.trials.len() == self.planned_trials && self.trials.iter().all(|t| t.outcome.passed)
    }

    /// Zero-based index of the first failing trial.
    pub fn first_failure(&self) -> Option<usize> {
        self.trials
            .iter()
            .find(|t| !t.outcome.passed)
            .map(|t| t.index)
    }

    pub fn interrupted(&self) -> bool {
        let failed_by_interrupt = self
            .trials
            .iter()
            .any(|t| t.outcome.failure == Some(TrialFailure::Interrupted));
        failed_by_interrupt || (self.trials.len() < self.planned_trials && self.first_failure().is_none())
    }

    /// Process exit status: the failing trial's index, 130 when interrupted,
    /// 0 when every trial passed.
    pub fn exit_code(&self) -> i32 {
        if self.interrupted() {
            return EXIT_INTERRUPTED;
        }
        self.first_failure()
            .map(|index| i32::try_from(index).unwrap_or(i32::MAX))
            .unwrap_or(0)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

pub struct TrialRunner {
    settings: TrialSettings,
    lifecycle: SupervisorLifecycle,
    transport: Box<dyn Transport>,
    params: Arc<dyn ParamStore>,
    shutdown: ShutdownSignal,
}

impl TrialRunner {
    pub fn new(
        settings: TrialSettings,
        lifecycle: SupervisorLifecycle,
        transport: Box<dyn Transport>,
        params: Arc<dyn ParamStore>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            settings,
            lifecycle,
            transport,
            params,
            shutdown,
        }
    }

    pub fn settings(&self) -> &TrialSettings {
        &self.settings
    }

    /// One-time setup before the first trial: enable the system and clear
    /// any readiness key left behind.
    pub fn prepare(&self) -> Result<()> {
        params::arm(self.params.as_ref(), &self.settings.enable_params)?;
        self.lifecycle.clear_readiness()
    }

    /// Runs up to `trials` trials, stopping at the first failure.
    pub fn run<F>(&mut self, trials: usize, mut on_event: F) -> Result<RunSummary>
    where
        F: FnMut(RunEvent<'_>),
    {
        self.prepare()?;
        let mut summary = RunSummary::new(trials);

        for index in 0..trials {
            if self.shutdown.is_shutdown_requested() {
                break;
            }
            on_event(RunEvent::TrialStarted {
                index,
                total: trials,
            });

            let started = Instant::now();
            let outcome = self.run_trial(&mut on_event);
            let record = TrialRecord {
                index,
                duration_secs: started.elapsed().as_secs_f64(),
                outcome,
            };
            info!(
                trial = index,
                passed = record.outcome.passed,
                duration_secs = record.duration_secs,
                "trial finished"
            );
            on_event(RunEvent::TrialFinished(&record));

            let passed = record.outcome.passed;
            summary.trials.push(record);
            if !passed {
                break;
            }
        }

        summary.finished_at = Some(Utc::now());
        Ok(summary)
    }

    /// Runs a single trial. The supervisor is stopped exactly once whatever
    /// happens in between.
    pub fn run_trial<F>(&mut self, on_event: &mut F) -> TrialOutcome
    where
        F: FnMut(RunEvent<'_>),
    {
        let Self {
            settings,
            lifecycle,
            transport,
            shutdown,
            ..
        } = self;

        let mut supervisor = match lifecycle.start(settings.grace_period) {
            Ok(guard) => guard,
            Err(e) => {
                return TrialOutcome::aborted(TrialFailure::Supervisor {
                    reason: e.to_string(),
                })
            }
        };
        on_event(RunEvent::SupervisorStarted {
            pid: supervisor.pid(),
        });

        let outcome = sample_trial(
            settings,
            transport.as_ref(),
            shutdown,
            &mut supervisor,
            on_event,
        );

        match supervisor.stop() {
            Ok(stopped) => on_event(RunEvent::SupervisorStopped(stopped)),
            Err(e) => warn!(error = %e, "supervisor teardown failed"),
        }
        outcome
    }
}

fn sample_trial<F>(
    settings: &TrialSettings,
    transport: &dyn Transport,
    shutdown: &ShutdownSignal,
    supervisor: &mut SupervisorGuard<'_>,
    on_event: &mut F,
) -> TrialOutcome
where
    F: FnMut(RunEvent<'_>),
{
    let options = SubscribeOptions {
        conflate: true,
        timeout: settings.receive_timeout,
    };
    let mut subscription = match transport.open(&settings.topic, options) {
        Ok(subscription) => subscription,
        Err(e) => {
            return TrialOutcome::aborted(TrialFailure::Transport {
                reason: e.to_string(),
            })
        }
    };

    on_event(RunEvent::WaitingForReadiness {
        timeout: settings.readiness_timeout,
    });
    let readiness =
        match supervisor.await_ready(settings.readiness_timeout, settings.readiness_poll, shutdown)
        {
            Ok(readiness) => readiness,
            Err(e) => {
                return TrialOutcome::aborted(TrialFailure::Supervisor {
                    reason: e.to_string(),
                })
            }
        };
    on_event(RunEvent::Readiness(readiness.clone()));
    match readiness {
        Readiness::Ready { .. } => {}
        Readiness::TimedOut { waited } => {
            if settings.abort_on_readiness_timeout {
                return TrialOutcome::aborted(TrialFailure::ReadinessTimeout {
                    waited_secs: waited.as_secs_f64(),
                });
            }
            warn!("continuing without readiness signal");
        }
        Readiness::Exited { status } => {
            return TrialOutcome::aborted(TrialFailure::SupervisorExited {
                status: status.to_string(),
            })
        }
        Readiness::Interrupted => return TrialOutcome::aborted(TrialFailure::Interrupted),
    }

    on_event(RunEvent::WarmingUp(settings.warm_up));
    if !shutdown.sleep(settings.warm_up) {
        return TrialOutcome::aborted(TrialFailure::Interrupted);
    }
    let first = match take_sample(subscription.as_mut(), SamplePoint::First, on_event) {
        Ok(snapshot) => snapshot,
        Err(failure) => return TrialOutcome::aborted(failure),
    };

    on_event(RunEvent::Measuring(settings.window));
    if !shutdown.sleep(settings.window) {
        return TrialOutcome::aborted(TrialFailure::Interrupted);
    }
    let last = match take_sample(subscription.as_mut(), SamplePoint::Last, on_event) {
        Ok(snapshot) => snapshot,
        Err(failure) => return TrialOutcome::aborted(failure),
    };

    evaluate(&first, &last, &settings.baselines)
}

fn take_sample<F>(
    subscription: &mut dyn Subscription,
    sample: SamplePoint,
    on_event: &mut F,
) -> std::result::Result<ProcessSnapshot, TrialFailure>
where
    F: FnMut(RunEvent<'_>),
{
    let snapshot = subscription.receive(true).ok_or_else(|| {
        warn!(%sample, "telemetry receive timed out");
        TrialFailure::NoTelemetryReceived { sample }
    })?;
    on_event(RunEvent::Sampled {
        sample,
        log_mono_time: snapshot.log_mono_time,
    });
    Ok(snapshot)
}
