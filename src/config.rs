use crate::analyzer::Baseline;
use crate::error::{CpuwatchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// The base config directory name under ~/.config/
const CONFIG_DIR_NAME: &str = "cpuwatch";

/// The filename for the configuration file.
const CONFIG_FILENAME: &str = "config.toml";

/// Environment variable overriding the number of trials.
pub const TRIALS_ENV_VAR: &str = "LOOP";

// ============================================================================
// Configuration
// ============================================================================

/// Top-level configuration for a cpuwatch run.
///
/// Every section and field has a default, so an empty file (or no file at
/// all) yields a usable configuration.
///
/// # Example
///
/// ```toml
/// trials = 3
///
/// [supervisor]
/// command = ["python", "selfdrive/manager.py"]
/// grace_period_secs = 20
///
/// [[baselines]]
/// name = "./camerad"
/// expected_cpu_percent = 7.07
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Number of trials to run.
    #[serde(default = "default_trials")]
    pub trials: u32,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub params: ParamsConfig,

    #[serde(default)]
    pub timing: TimingConfig,

    /// Processes to check and their expected CPU percentage.
    #[serde(default = "default_baselines")]
    pub baselines: Vec<Baseline>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Program and arguments used to launch the supervisor.
    pub command: Vec<String>,

    /// Working directory for the supervisor. Defaults to the current one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Pass the supervisor's stdout/stderr through to this terminal.
    pub inherit_output: bool,

    /// Seconds to wait after SIGTERM before sending SIGKILL.
    pub grace_period_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            command: vec!["python".to_string(), "selfdrive/manager.py".to_string()],
            working_dir: None,
            inherit_output: true,
            grace_period_secs: 20,
        }
    }
}

/// Where process telemetry comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TelemetrySource {
    /// Subscribe to an external publisher over a Unix socket.
    Socket,
    /// Sample /proc locally.
    Procfs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub source: TelemetrySource,
    pub topic: String,
    /// Directory holding `<topic>.sock` for the socket source.
    pub socket_dir: PathBuf,
    /// Upper bound for each snapshot receive.
    pub receive_timeout_ms: u64,
    /// Root of the proc filesystem for the procfs source.
    pub proc_root: PathBuf,
    /// Publish interval of the procfs source.
    pub sample_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            source: TelemetrySource::Socket,
            topic: "procLog".to_string(),
            socket_dir: PathBuf::from("/tmp/cpuwatch"),
            receive_timeout_ms: 2000,
            proc_root: PathBuf::from("/proc"),
            sample_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamsConfig {
    /// Directory of the parameter store (one file per key).
    pub dir: PathBuf,
    /// Key whose presence means the supervised system finished starting.
    pub readiness_key: String,
    /// Keys written once before the first trial to enable the system.
    pub enable: BTreeMap<String, String>,
}

impl Default for ParamsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/data/params/d"),
            readiness_key: "CarParams".to_string(),
            enable: default_enable_params(),
        }
    }
}

fn default_enable_params() -> BTreeMap<String, String> {
    [
        ("HasAcceptedTerms", "2"),
        ("HasCompletedSetup", "1"),
        ("CompletedTrainingVersion", "0"),
        ("OpenpilotEnabledToggle", "1"),
        ("Passive", "0"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub readiness_timeout_secs: u64,
    pub readiness_poll_secs: u64,
    /// Delay between readiness and the first sample.
    pub warm_up_secs: u64,
    /// Delay between the first and last sample.
    pub window_secs: u64,
    /// When false, a readiness timeout is logged and sampling continues.
    pub abort_on_readiness_timeout: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            readiness_timeout_secs: 210,
            readiness_poll_secs: 2,
            warm_up_secs: 5,
            window_secs: 20,
            abort_on_readiness_timeout: true,
        }
    }
}

fn default_trials() -> u32 {
    1
}

fn default_baselines() -> Vec<Baseline> {
    vec![
        Baseline::new("./camerad", 7.07),
        Baseline::new("./_dmonitoringmodeld", 3.5),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trials: default_trials(),
            supervisor: SupervisorConfig::default(),
            telemetry: TelemetryConfig::default(),
            params: ParamsConfig::default(),
            timing: TimingConfig::default(),
            baselines: default_baselines(),
        }
    }
}

// ============================================================================
// Config Validation
// ============================================================================

use std::error::Error;
use std::fmt;

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    NoTrials,
    EmptySupervisorCommand,
    ZeroPollInterval,
    ZeroReceiveTimeout,
    NoBaselines,
    EmptyBaselineName { index: usize },
    InvalidExpectedPercent { name: String, value: f64 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoTrials => write!(f, "`trials` must be at least 1"),
            ConfigError::EmptySupervisorCommand => {
                write!(f, "`supervisor.command` must name a program to run")
            }
            ConfigError::ZeroPollInterval => {
                write!(f, "`timing.readiness_poll_secs` must be greater than 0")
            }
            ConfigError::ZeroReceiveTimeout => {
                write!(f, "`telemetry.receive_timeout_ms` must be greater than 0")
            }
            ConfigError::NoBaselines => write!(
                f,
                "No baselines configured. Add at least one [[baselines]] entry"
            ),
            ConfigError::EmptyBaselineName { index } => {
                write!(f, "Baseline #{} has an empty `name`", index + 1)
            }
            ConfigError::InvalidExpectedPercent { name, value } => write!(
                f,
                "Baseline '{}' has invalid `expected_cpu_percent` {} (must be a finite value >= 0)",
                name, value
            ),
        }
    }
}

impl Error for ConfigError {}

/// Validate a configuration for logical consistency.
///
/// Returns the first problem found.
pub fn validate_config(config: &Config) -> std::result::Result<(), ConfigError> {
    if config.trials == 0 {
        return Err(ConfigError::NoTrials);
    }
    if config.supervisor.command.is_empty() || config.supervisor.command[0].trim().is_empty() {
        return Err(ConfigError::EmptySupervisorCommand);
    }
    if config.timing.readiness_poll_secs == 0 {
        return Err(ConfigError::ZeroPollInterval);
    }
    if config.telemetry.receive_timeout_ms == 0 {
        return Err(ConfigError::ZeroReceiveTimeout);
    }
    if config.baselines.is_empty() {
        return Err(ConfigError::NoBaselines);
    }
    for (index, baseline) in config.baselines.iter().enumerate() {
        if baseline.name.is_empty() {
            return Err(ConfigError::EmptyBaselineName { index });
        }
        let value = baseline.expected_cpu_percent;
        if !value.is_finite() || value < 0.0 {
            return Err(ConfigError::InvalidExpectedPercent {
                name: baseline.name.clone(),
                value,
            });
        }
    }
    Ok(())
}

// ============================================================================
// Loading
// ============================================================================

const CONFIG_HEADER: &str = "# cpuwatch configuration
# Trials launch the supervisor, wait for the readiness key, sample CPU
# counters twice and compare each baseline against its tolerance band:
#   upper = max(expected * 1.10, expected + 5)
#   lower = min(expected * 0.65, max(expected - 1, 0))
# The LOOP environment variable overrides `trials`.

";

/// Get the cpuwatch config directory path (~/.config/cpuwatch/).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CpuwatchError::Config("Could not determine home directory".to_string()))?;
    Ok(home.join(".config").join(CONFIG_DIR_NAME))
}

/// Get the path to the default config file (~/.config/cpuwatch/config.toml).
pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILENAME))
}

/// Parse configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    Ok(toml::from_str(content)?)
}

/// Load configuration.
///
/// An explicit `path` must exist. Without one, the default location is
/// used if present, otherwise built-in defaults.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config_path = match path {
        Some(path) => {
            if !path.exists() {
                return Err(CpuwatchError::ConfigNotFound(path.to_path_buf()));
            }
            path.to_path_buf()
        }
        None => {
            let default_path = default_config_path()?;
            if !default_path.exists() {
                return Ok(Config::default());
            }
            default_path
        }
    };

    let content = fs::read_to_string(&config_path)?;
    toml::from_str(&content).map_err(|e| {
        CpuwatchError::Config(format!(
            "Failed to parse config file at {:?}: {}",
            config_path, e
        ))
    })
}

/// Render a configuration as commented TOML.
pub fn render_config(config: &Config) -> Result<String> {
    let body = toml::to_string_pretty(config)
        .map_err(|e| CpuwatchError::Config(format!("Failed to serialize config: {}", e)))?;
    Ok(format!("{}{}", CONFIG_HEADER, body))
}

/// Write the default configuration to `path`, refusing to overwrite.
pub fn write_default_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(CpuwatchError::Config(format!(
            "Refusing to overwrite existing config at {:?}",
            path
        )));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, render_config(&Config::default())?)?;
    Ok(())
}

/// Raw `LOOP` value, if set.
fn trials_env() -> Result<Option<String>> {
    match env::var(TRIALS_ENV_VAR) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(CpuwatchError::Config(format!(
            "{} is not valid unicode: {}",
            TRIALS_ENV_VAR, e
        ))),
    }
}

fn parse_trials(value: &str) -> Result<u32> {
    value.trim().parse().map_err(|_| {
        CpuwatchError::Config(format!(
            "{} must be a non-negative integer, got {:?}",
            TRIALS_ENV_VAR, value
        ))
    })
}

/// Trial count precedence: CLI flag, then the `LOOP` value, then the
/// config file (which defaults to 1). `LOOP` is only parsed when it is used.
pub fn resolve_trials(
    cli_trials: Option<u32>,
    env_trials: Option<&str>,
    file_trials: u32,
) -> Result<u32> {
    if let Some(trials) = cli_trials {
        return Ok(trials);
    }
    match env_trials {
        Some(value) => parse_trials(value),
        None => Ok(file_trials),
    }
}

/// Resolve the trial count for a run, reading `LOOP` from the environment.
pub fn effective_trials(config: &Config, cli_trials: Option<u32>) -> Result<u32> {
    if cli_trials.is_some() {
        return resolve_trials(cli_trials, None, config.trials);
    }
    let env_trials = trials_env()?;
    resolve_trials(None, env_trials.as_deref(), config.trials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_classic_harness() {
        let config = Config::default();
        assert_eq!(config.trials, 1);
        assert_eq!(config.telemetry.topic, "procLog");
        assert_eq!(config.telemetry.receive_timeout_ms, 2000);
        assert_eq!(config.params.readiness_key, "CarParams");
        assert_eq!(config.timing.readiness_timeout_secs, 210);
        assert_eq!(config.timing.readiness_poll_secs, 2);
        assert_eq!(config.timing.warm_up_secs, 5);
        assert_eq!(config.timing.window_secs, 20);
        assert_eq!(config.supervisor.grace_period_secs, 20);
        assert_eq!(config.baselines.len(), 2);
        assert_eq!(config.baselines[0], Baseline::new("./camerad", 7.07));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_empty_file_parses_to_defaults() {
        assert_eq!(parse_config("").unwrap(), Config::default());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = parse_config(
            r#"
trials = 4

[timing]
window_secs = 60

[telemetry]
source = "procfs"
"#,
        )
        .unwrap();

        assert_eq!(config.trials, 4);
        assert_eq!(config.timing.window_secs, 60);
        assert_eq!(config.timing.warm_up_secs, 5);
        assert_eq!(config.telemetry.source, TelemetrySource::Procfs);
        assert_eq!(config.telemetry.topic, "procLog");
        assert_eq!(config.baselines, default_baselines());
    }

    #[test]
    fn test_baselines_replace_defaults() {
        let config = parse_config(
            r#"
[[baselines]]
name = "./_modeld"
expected_cpu_percent = 7.12
"#,
        )
        .unwrap();
        assert_eq!(config.baselines, vec![Baseline::new("./_modeld", 7.12)]);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(parse_config("trials = \"many\"").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.trials = 0;
        assert_eq!(validate_config(&config), Err(ConfigError::NoTrials));

        let mut config = Config::default();
        config.supervisor.command.clear();
        assert_eq!(
            validate_config(&config),
            Err(ConfigError::EmptySupervisorCommand)
        );

        let mut config = Config::default();
        config.timing.readiness_poll_secs = 0;
        assert_eq!(validate_config(&config), Err(ConfigError::ZeroPollInterval));

        let mut config = Config::default();
        config.telemetry.receive_timeout_ms = 0;
        assert_eq!(
            validate_config(&config),
            Err(ConfigError::ZeroReceiveTimeout)
        );

        let mut config = Config::default();
        config.baselines.clear();
        assert_eq!(validate_config(&config), Err(ConfigError::NoBaselines));

        let mut config = Config::default();
        config.baselines[1].name.clear();
        assert_eq!(
            validate_config(&config),
            Err(ConfigError::EmptyBaselineName { index: 1 })
        );

        let mut config = Config::default();
        config.baselines[0].expected_cpu_percent = -1.0;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::InvalidExpectedPercent { .. })
        ));
    }

    #[test]
    fn test_config_error_messages_are_actionable() {
        assert_eq!(
            ConfigError::EmptyBaselineName { index: 0 }.to_string(),
            "Baseline #1 has an empty `name`"
        );
        assert!(ConfigError::NoBaselines.to_string().contains("[[baselines]]"));
    }

    #[test]
    fn test_load_config_explicit_missing_path() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope.toml");
        assert!(matches!(
            load_config(Some(&missing)),
            Err(CpuwatchError::ConfigNotFound(_))
        ));
    }

    #[test]
    fn test_load_config_reports_parse_errors_with_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "[timing\n").unwrap();
        let err = load_config(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn test_write_default_config_round_trips_and_refuses_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        write_default_config(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# cpuwatch configuration"));
        assert_eq!(load_config(Some(&path)).unwrap(), Config::default());

        assert!(write_default_config(&path).is_err());
    }

    #[test]
    fn test_parse_trials() {
        assert_eq!(parse_trials("3").unwrap(), 3);
        assert_eq!(parse_trials(" 10 ").unwrap(), 10);
        assert!(parse_trials("-1").is_err());
        assert!(parse_trials("lots").is_err());
    }

    #[test]
    fn test_resolve_trials_precedence() {
        // Flag beats LOOP, even an invalid one.
        assert_eq!(resolve_trials(Some(7), Some("3"), 2).unwrap(), 7);
        assert_eq!(resolve_trials(Some(7), Some("lots"), 2).unwrap(), 7);
        // LOOP beats the file.
        assert_eq!(resolve_trials(None, Some("3"), 2).unwrap(), 3);
        assert_eq!(resolve_trials(None, Some(" 5\n"), 2).unwrap(), 5);
        // The file is used when neither is given.
        assert_eq!(resolve_trials(None, None, 2).unwrap(), 2);
    }

    #[test]
    fn test_resolve_trials_defaults_to_one() {
        let config = parse_config("").unwrap();
        assert_eq!(resolve_trials(None, None, config.trials).unwrap(), 1);
    }

    #[test]
    fn test_resolve_trials_rejects_invalid_loop() {
        let err = resolve_trials(None, Some("-2"), 2).unwrap_err();
        assert!(err.to_string().contains("LOOP"));
        assert!(resolve_trials(None, Some(""), 2).is_err());
    }

    #[test]
    fn test_cli_trials_take_precedence() {
        let config = Config {
            trials: 2,
            ..Config::default()
        };
        assert_eq!(effective_trials(&config, Some(7)).unwrap(), 7);
    }

    #[test]
    fn test_config_dir_ends_with_cpuwatch() {
        if let Ok(dir) = config_dir() {
            assert!(dir.ends_with(".config/cpuwatch"));
        }
    }
}
