//! cpuwatch CLI entry point.
//!
//! Parses command-line arguments and dispatches to the appropriate command handler.

use clap::{Parser, Subcommand};
use cpuwatch::commands::{config_command, evaluate_command, run_command, RunOptions};
use cpuwatch::config::TelemetrySource;
use cpuwatch::output::print_error;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cpuwatch")]
#[command(
    version,
    about = "CPU regression harness for processes running under a supervisor",
    after_help = "EXAMPLES:
    # Run the configured number of trials (default: 1)
    cpuwatch
    LOOP=5 cpuwatch run

    # Sample /proc directly instead of subscribing to a publisher
    cpuwatch run --source procfs --trials 3

    # Re-check two recorded snapshots against the baselines
    cpuwatch evaluate --first before.json --last after.json

EXIT STATUS:
    0    all trials passed
    N    index of the failing trial (zero-based)
    130  interrupted with Ctrl+C"
)]
struct Cli {
    /// Path to the config file (default: ~/.config/cpuwatch/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Show debug logs on stderr instead of spinners
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run CPU regression trials against the supervisor
    Run {
        /// Number of trials (overrides LOOP and the config file)
        #[arg(short, long)]
        trials: Option<u32>,

        /// Where process telemetry comes from
        #[arg(long, value_enum)]
        source: Option<TelemetrySource>,

        /// Write a JSON run summary to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Evaluate two recorded procLog snapshots against the baselines
    Evaluate {
        /// Snapshot taken at the start of the window
        #[arg(long)]
        first: PathBuf,

        /// Snapshot taken at the end of the window
        #[arg(long)]
        last: PathBuf,

        /// Write the evaluation as JSON to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Show the effective configuration
    Config {
        /// Write a default config file instead of displaying it
        #[arg(long)]
        init: bool,
    },
}

/// Logs go to stderr at WARN, or DEBUG with `--verbose`. `RUST_LOG` refines either.
fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = cli.config.as_deref();
    let result = match cli.command {
        None => run_command(&RunOptions {
            config_path: cli.config.clone(),
            verbose: cli.verbose,
            ..RunOptions::default()
        }),
        Some(Commands::Run {
            trials,
            source,
            report,
        }) => run_command(&RunOptions {
            config_path: cli.config.clone(),
            trials,
            source,
            report,
            verbose: cli.verbose,
        }),
        Some(Commands::Evaluate {
            first,
            last,
            report,
        }) => evaluate_command(&first, &last, config, report.as_deref()),
        Some(Commands::Config { init }) => config_command(config, init).map(|()| 0),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            print_error(&e.to_string());
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_args_runs_with_defaults() {
        let cli = Cli::try_parse_from(["cpuwatch"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from([
            "cpuwatch", "run", "--trials", "3", "--source", "procfs", "--report", "out.json", "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Some(Commands::Run {
                trials,
                source,
                report,
            }) => {
                assert_eq!(trials, Some(3));
                assert_eq!(source, Some(TelemetrySource::Procfs));
                assert_eq!(report, Some(PathBuf::from("out.json")));
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_unknown_source_is_rejected() {
        assert!(Cli::try_parse_from(["cpuwatch", "run", "--source", "zmq"]).is_err());
    }

    #[test]
    fn test_evaluate_requires_both_snapshots() {
        assert!(Cli::try_parse_from(["cpuwatch", "evaluate", "--first", "a.json"]).is_err());
        let cli =
            Cli::try_parse_from(["cpuwatch", "evaluate", "--first", "a.json", "--last", "b.json"])
                .unwrap();
        assert!(matches!(cli.command, Some(Commands::Evaluate { .. })));
    }

    #[test]
    fn test_global_config_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["cpuwatch", "config", "--init", "--config", "c.toml"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("c.toml")));
        assert!(matches!(cli.command, Some(Commands::Config { init: true })));
    }
}
