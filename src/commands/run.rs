//! Run command handler.
//!
//! Wires the configured supervisor, parameter store and telemetry source
//! into a [`TrialRunner`] and reports each trial as it finishes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::{effective_trials, load_config, Config, TelemetryConfig, TelemetrySource};
use crate::error::Result;
use crate::output::{print_info, print_interrupted, print_run_summary};
use crate::params::{FileParamStore, ParamStore};
use crate::progress::ConsoleReporter;
use crate::runner::{RunSummary, TrialRunner, TrialSettings};
use crate::signal::ShutdownSignal;
use crate::supervisor::{CommandLauncher, SupervisorLifecycle};
use crate::telemetry::{ProcfsTransport, SocketTransport, Transport};

use super::ensure_valid;

/// Options for `cpuwatch run`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Explicit config file. Defaults to ~/.config/cpuwatch/config.toml.
    pub config_path: Option<PathBuf>,
    /// Trial count override, taking precedence over `LOOP`.
    pub trials: Option<u32>,
    /// Telemetry source override.
    pub source: Option<TelemetrySource>,
    /// Where to write the JSON run summary.
    pub report: Option<PathBuf>,
    pub verbose: bool,
}

/// Run trials and return the process exit status.
///
/// # Returns
///
/// * `Ok(code)` - 0 when all trials passed, the failing trial's index on a
///   regression, 130 when interrupted
/// * `Err(CpuwatchError)` if setup fails before the first trial
pub fn run_command(options: &RunOptions) -> Result<i32> {
    let config = resolve_config(options)?;
    info!(
        trials = config.trials,
        source = ?config.telemetry.source,
        command = ?config.supervisor.command,
        "starting run"
    );

    let params: Arc<dyn ParamStore> = Arc::new(FileParamStore::open(&config.params.dir)?);
    let launcher = CommandLauncher::new(&config.supervisor.command)?
        .working_dir(config.supervisor.working_dir.clone())
        .inherit_output(config.supervisor.inherit_output);
    let lifecycle = SupervisorLifecycle::new(
        Box::new(launcher),
        Arc::clone(&params),
        config.params.readiness_key.clone(),
    );
    let shutdown = ShutdownSignal::install()?;

    let runner = TrialRunner::new(
        TrialSettings::from_config(&config),
        lifecycle,
        build_transport(&config.telemetry),
        params,
        shutdown,
    );

    let summary = execute_run(runner, config.trials as usize, options)?;
    Ok(summary.exit_code())
}

/// Load the config and apply command-line overrides.
fn resolve_config(options: &RunOptions) -> Result<Config> {
    let mut config = load_config(options.config_path.as_deref())?;
    config.trials = effective_trials(&config, options.trials)?;
    if let Some(source) = options.source {
        config.telemetry.source = source;
    }
    ensure_valid(&config)?;
    Ok(config)
}

fn build_transport(telemetry: &TelemetryConfig) -> Box<dyn Transport> {
    match telemetry.source {
        TelemetrySource::Socket => {
            debug!(dir = %telemetry.socket_dir.display(), "using socket telemetry");
            Box::new(SocketTransport::new(telemetry.socket_dir.clone()))
        }
        TelemetrySource::Procfs => {
            debug!(root = %telemetry.proc_root.display(), "using procfs telemetry");
            Box::new(ProcfsTransport::new(
                telemetry.proc_root.clone(),
                Duration::from_millis(telemetry.sample_interval_ms),
            ))
        }
    }
}

/// Drive an assembled runner, print progress and the final summary, and
/// save the report if one was requested.
pub fn execute_run(
    mut runner: TrialRunner,
    trials: usize,
    options: &RunOptions,
) -> Result<RunSummary> {
    let mut reporter = ConsoleReporter::new(options.verbose);
    let summary = runner.run(trials, |event| reporter.handle(&event))?;
    reporter.clear();

    if summary.interrupted() {
        print_interrupted();
    }
    print_run_summary(&summary);

    if let Some(path) = &options.report {
        summary.save(path)?;
        print_info(&format!("Run report written to {}", path.display()));
    }
    Ok(summary)
}
