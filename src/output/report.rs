//! CPU report and trial status output.

use super::colors::*;
use crate::analyzer::{ProcessOutcome, TrialOutcome};
use crate::runner::{RunSummary, TrialRecord};

const RULE: &str = "------------------------------------------------";
const NAME_WIDTH: usize = 35;

/// Render the per-process CPU table without colors.
///
/// Each regression is preceded by a `Warning` line; processes without data
/// show `NO METRICS FOUND`.
pub fn format_cpu_report(outcome: &TrialOutcome) -> String {
    let mut lines = vec![RULE.to_string()];
    for report in &outcome.processes {
        match &report.outcome {
            ProcessOutcome::Within { measured_percent } => {
                lines.push(format!(
                    "{:<width$}  {:.2}%",
                    report.name,
                    measured_percent,
                    width = NAME_WIDTH
                ));
            }
            ProcessOutcome::Regression {
                measured_percent,
                deviation,
            } => {
                lines.push(format!("Warning {} {}", report.name, deviation));
                lines.push(format!(
                    "{:<width$}  {:.2}%",
                    report.name,
                    measured_percent,
                    width = NAME_WIDTH
                ));
            }
            ProcessOutcome::Missing { .. } => {
                lines.push(format!(
                    "{:<width$}  NO METRICS FOUND",
                    report.name,
                    width = NAME_WIDTH
                ));
            }
        }
    }
    if let Some(failure) = &outcome.failure {
        lines.push(format!("Trial failed: {}", failure));
    }
    lines.push(RULE.to_string());
    lines.join("\n")
}

/// Print the CPU table, highlighting regressions and missing processes.
pub fn print_cpu_report(outcome: &TrialOutcome) {
    println!("{GRAY}{RULE}{RESET}");
    for report in &outcome.processes {
        match &report.outcome {
            ProcessOutcome::Within { measured_percent } => {
                println!(
                    "{:<width$}  {GREEN}{:.2}%{RESET} {DIM}(expected {:.2}%){RESET}",
                    report.name,
                    measured_percent,
                    report.expected_percent,
                    width = NAME_WIDTH
                );
            }
            ProcessOutcome::Regression {
                measured_percent,
                deviation,
            } => {
                println!("{YELLOW}Warning{RESET} {} {}", report.name, deviation);
                println!(
                    "{:<width$}  {RED}{:.2}%{RESET} {DIM}(allowed {:.2}% - {:.2}%){RESET}",
                    report.name,
                    measured_percent,
                    report.band.lower,
                    report.band.upper,
                    width = NAME_WIDTH
                );
            }
            ProcessOutcome::Missing { reason } => {
                println!(
                    "{:<width$}  {RED}NO METRICS FOUND{RESET} {DIM}({}){RESET}",
                    report.name,
                    reason,
                    width = NAME_WIDTH
                );
            }
        }
    }
    if let Some(failure) = &outcome.failure {
        println!("{RED}Trial failed:{RESET} {}", failure);
    }
    println!("{GRAY}{RULE}{RESET}");
}

pub fn print_trial_start(index: usize, total: usize) {
    println!();
    println!("{BOLD}Trial {} of {}{RESET}", index + 1, total);
}

pub fn print_trial_passed(record: &TrialRecord) {
    println!();
    println!(
        "{GREEN}{BOLD}PASSED RUN {}{RESET}, took {:.1}s",
        record.index, record.duration_secs
    );
    println!();
}

pub fn print_trial_failed(record: &TrialRecord) {
    println!();
    println!("{RED}{BOLD}FAILED ON RUN {}{RESET}", record.index);
    if let Some(failure) = &record.outcome.failure {
        println!("{RED}{}{RESET}", failure);
    }
    println!();
}

pub fn print_run_summary(summary: &RunSummary) {
    let passed = summary.trials.iter().filter(|t| t.outcome.passed).count();
    let total_secs: f64 = summary.trials.iter().map(|t| t.duration_secs).sum();
    let status = if summary.passed() {
        format!("{GREEN}{BOLD}PASSED{RESET}")
    } else {
        format!("{RED}{BOLD}FAILED{RESET}")
    };
    println!(
        "{} {}/{} trials passed in {:.1}s {GRAY}(run {}){RESET}",
        status, passed, summary.planned_trials, total_secs, summary.run_id
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{evaluate, Baseline};
    use crate::error::{SamplePoint, TrialFailure};
    use crate::snapshot::{ProcessSnapshot, ProcessStat};

    fn stat(name: &str, user: f64) -> ProcessStat {
        ProcessStat {
            pid: 1,
            name: String::new(),
            cmdline: vec![name.to_string()],
            cpu_user: user,
            cpu_system: 0.0,
            cpu_children_user: 0.0,
            cpu_children_system: 0.0,
        }
    }

    fn mixed_outcome() -> TrialOutcome {
        let first = ProcessSnapshot::new(0, vec![stat("./camerad", 0.0), stat("./hot", 0.0)]);
        let last = ProcessSnapshot::new(
            10_000_000_000,
            vec![stat("./camerad", 0.75), stat("./hot", 5.0)],
        );
        evaluate(
            &first,
            &last,
            &[
                Baseline::new("./camerad", 7.07),
                Baseline::new("./hot", 7.07),
                Baseline::new("./_dmonitoringmodeld", 3.5),
            ],
        )
    }

    #[test]
    fn test_format_cpu_report_layout() {
        let report = format_cpu_report(&mixed_outcome());
        let lines: Vec<&str> = report.lines().collect();

        assert_eq!(lines[0], RULE);
        assert_eq!(lines[1], format!("{:<35}  7.50%", "./camerad"));
        assert_eq!(lines[2], "Warning ./hot using more CPU than normal");
        assert_eq!(lines[3], format!("{:<35}  50.00%", "./hot"));
        assert_eq!(
            lines[4],
            format!("{:<35}  NO METRICS FOUND", "./_dmonitoringmodeld")
        );
        assert_eq!(lines[5], RULE);
        assert_eq!(lines.len(), 6);
    }

    #[test]
    fn test_format_cpu_report_includes_trial_failure() {
        let outcome = TrialOutcome::aborted(TrialFailure::NoTelemetryReceived {
            sample: SamplePoint::First,
        });
        let report = format_cpu_report(&outcome);
        assert!(report.contains("Trial failed: no telemetry received for the first sample"));
    }

    #[test]
    fn test_print_functions_smoke() {
        let outcome = mixed_outcome();
        print_cpu_report(&outcome);
        print_trial_start(0, 2);
        let record = TrialRecord {
            index: 0,
            duration_secs: 31.2,
            outcome,
        };
        print_trial_failed(&record);
        print_trial_passed(&record);

        let mut summary = RunSummary::new(2);
        summary.trials.push(record);
        print_run_summary(&summary);
    }
}
