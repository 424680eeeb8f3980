//! Console progress for trial runs: a wait spinner plus the reporter that
//! turns [`RunEvent`]s into terminal output.

use crate::output::{
    print_cpu_report, print_trial_failed, print_trial_passed, print_trial_start, print_warning,
    DIM, GREEN, RESET,
};
use crate::runner::RunEvent;
use crate::supervisor::Readiness;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const SPINNER_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";
const SPINNER_TEMPLATE: &str = "{spinner:.cyan} {msg} {elapsed_precise:.dim}";
const TICK_INTERVAL: Duration = Duration::from_millis(80);

/// Spinner shown while the harness blocks on a timed phase.
pub struct WaitSpinner {
    bar: ProgressBar,
}

impl WaitSpinner {
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_bar(ProgressBar::new_spinner(), message)
    }

    /// A spinner that never draws. Used when output is verbose.
    pub fn hidden(message: impl Into<String>) -> Self {
        Self::with_bar(ProgressBar::hidden(), message)
    }

    fn with_bar(bar: ProgressBar, message: impl Into<String>) -> Self {
        let style = ProgressStyle::with_template(SPINNER_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars(SPINNER_CHARS);
        bar.set_style(style);
        bar.set_message(message.into());
        bar.enable_steady_tick(TICK_INTERVAL);
        Self { bar }
    }

    #[cfg(test)]
    pub fn set_message(&self, message: impl Into<String>) {
        self.bar.set_message(message.into());
    }

    #[cfg(test)]
    pub fn elapsed(&self) -> Duration {
        self.bar.elapsed()
    }

    /// Clear the spinner line so the next message starts on a clean line.
    pub fn finish(self) {
        self.bar.finish_and_clear();
    }
}

impl Drop for WaitSpinner {
    fn drop(&mut self) {
        if !self.bar.is_finished() {
            self.bar.finish_and_clear();
        }
    }
}

/// Prints run progress. In verbose mode spinners are suppressed so tracing
/// output is not interleaved with redraws.
pub struct ConsoleReporter {
    verbose: bool,
    spinner: Option<WaitSpinner>,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            spinner: None,
        }
    }

    #[cfg(test)]
    pub fn is_waiting(&self) -> bool {
        self.spinner.is_some()
    }

    pub fn handle(&mut self, event: &RunEvent<'_>) {
        match event {
            RunEvent::TrialStarted { index, total } => {
                self.clear();
                print_trial_start(*index, *total);
            }
            RunEvent::SupervisorStarted { pid } => {
                self.clear();
                match pid {
                    Some(pid) => println!("{DIM}Supervisor started (pid {}){RESET}", pid),
                    None => println!("{DIM}Supervisor started{RESET}"),
                }
            }
            RunEvent::WaitingForReadiness { timeout } => {
                self.wait(format!(
                    "Waiting for supervisor readiness (up to {}s)",
                    timeout.as_secs()
                ));
            }
            RunEvent::Readiness(readiness) => {
                self.clear();
                match readiness {
                    Readiness::Ready { after } => {
                        println!(
                            "{GREEN}\u{2714} Supervisor ready after {:.1}s{RESET}",
                            after.as_secs_f64()
                        );
                    }
                    Readiness::TimedOut { waited } => print_warning(&format!(
                        "Supervisor not ready after {:.0}s",
                        waited.as_secs_f64()
                    )),
                    Readiness::Exited { status } => {
                        print_warning(&format!("Supervisor exited early ({})", status))
                    }
                    Readiness::Interrupted => {}
                }
            }
            RunEvent::WarmingUp(duration) => {
                self.wait(format!("Warming up for {}s", duration.as_secs()));
            }
            RunEvent::Sampled {
                sample,
                log_mono_time,
            } => {
                self.clear();
                println!(
                    "{DIM}Took {} sample at logMonoTime {}{RESET}",
                    sample, log_mono_time
                );
            }
            RunEvent::Measuring(duration) => {
                self.wait(format!("Measuring CPU usage for {}s", duration.as_secs()));
            }
            RunEvent::SupervisorStopped(outcome) => {
                self.clear();
                println!("{DIM}Supervisor {}{RESET}", outcome);
            }
            RunEvent::TrialFinished(record) => {
                self.clear();
                if !record.outcome.processes.is_empty() {
                    print_cpu_report(&record.outcome);
                }
                if record.outcome.passed {
                    print_trial_passed(record);
                } else {
                    print_trial_failed(record);
                }
            }
        }
    }

    fn wait(&mut self, message: String) {
        self.clear();
        self.spinner = Some(if self.verbose {
            WaitSpinner::hidden(message)
        } else {
            WaitSpinner::new(message)
        });
    }

    /// Finish any active spinner.
    pub fn clear(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish();
        }
    }
}

impl Drop for ConsoleReporter {
    fn drop(&mut self) {
        self.clear();
    }
}
