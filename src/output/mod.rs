//! Terminal output formatting for cpuwatch.
//!
//! - [`messages`] - Error, warning, and info messages
//! - [`report`] - CPU reports, per-trial status lines and run summaries

pub mod messages;
pub mod report;

/// ANSI color codes for terminal output.
pub mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const CYAN: &str = "\x1b[36m";
    pub const RED: &str = "\x1b[31m";
    pub const GRAY: &str = "\x1b[90m";
}

pub use colors::*;

pub use messages::{print_error, print_info, print_interrupted, print_warning};
pub use report::{
    format_cpu_report, print_cpu_report, print_run_summary, print_trial_failed,
    print_trial_passed, print_trial_start,
};
