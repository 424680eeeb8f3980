//! CPU delta analysis.
//!
//! Turns a pair of [`ProcessSnapshot`]s into per-process utilization figures
//! and checks each against its [`Baseline`] using an asymmetric tolerance band.
//! Everything here is pure; no I/O and no clocks.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TrialFailure;
use crate::snapshot::ProcessSnapshot;

const NANOS_PER_SEC: f64 = 1e9;

/// Expected CPU utilization for one monitored process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    /// Matched against command-line tokens by substring; first match wins.
    pub name: String,
    pub expected_cpu_percent: f64,
}

impl Baseline {
    pub fn new(name: impl Into<String>, expected_cpu_percent: f64) -> Self {
        Self {
            name: name.into(),
            expected_cpu_percent,
        }
    }

    pub fn band(&self) -> ToleranceBand {
        ToleranceBand::for_expected(self.expected_cpu_percent)
    }
}

/// Inclusive `[lower, upper]` range of acceptable CPU percentages.
///
/// The band is wider above than below: small processes get at least five
/// points of headroom, while the floor never drops by more than one point
/// or 35%, whichever is lower.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ToleranceBand {
    pub lower: f64,
    pub upper: f64,
}

impl ToleranceBand {
    pub fn for_expected(expected: f64) -> Self {
        Self {
            lower: (expected * 0.65).min((expected - 1.0).max(0.0)),
            upper: (expected * 1.10).max(expected + 5.0),
        }
    }

    /// Returns the direction of the deviation, or `None` if within band.
    pub fn check(&self, measured: f64) -> Option<Deviation> {
        if measured > self.upper {
            Some(Deviation::Above)
        } else if measured < self.lower {
            Some(Deviation::Below)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Deviation {
    Above,
    Below,
}

impl fmt::Display for Deviation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deviation::Above => write!(f, "using more CPU than normal"),
            Deviation::Below => write!(f, "using less CPU than normal"),
        }
    }
}

/// Why a process has no measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingReason {
    AbsentFromFirst,
    AbsentFromLast,
    AbsentFromBoth,
    /// Counters went backwards, so the process restarted in between.
    CounterReset,
}

impl fmt::Display for MissingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingReason::AbsentFromFirst => write!(f, "not found in first snapshot"),
            MissingReason::AbsentFromLast => write!(f, "not found in last snapshot"),
            MissingReason::AbsentFromBoth => write!(f, "not found in either snapshot"),
            MissingReason::CounterReset => write!(f, "CPU counters reset (process restarted)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Within { measured_percent: f64 },
    Regression {
        measured_percent: f64,
        deviation: Deviation,
    },
    Missing { reason: MissingReason },
}

impl ProcessOutcome {
    pub fn measured_percent(&self) -> Option<f64> {
        match self {
            ProcessOutcome::Within { measured_percent }
            | ProcessOutcome::Regression {
                measured_percent, ..
            } => Some(*measured_percent),
            ProcessOutcome::Missing { .. } => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ProcessOutcome::Within { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessReport {
    pub name: String,
    pub expected_percent: f64,
    pub band: ToleranceBand,
    pub outcome: ProcessOutcome,
}

/// Result of one trial. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialOutcome {
    pub passed: bool,
    /// Seconds between the two snapshots, if the trial got that far.
    pub interval_secs: Option<f64>,
    pub processes: Vec<ProcessReport>,
    pub failure: Option<TrialFailure>,
}

impl TrialOutcome {
    /// A trial that ended before any evaluation could run.
    pub fn aborted(failure: TrialFailure) -> Self {
        Self {
            passed: false,
            interval_secs: None,
            processes: Vec::new(),
            failure: Some(failure),
        }
    }

    fn evaluated(interval_secs: f64, processes: Vec<ProcessReport>) -> Self {
        let passed = processes.iter().all(|p| p.outcome.is_ok());
        Self {
            passed,
            interval_secs: Some(interval_secs),
            processes,
            failure: None,
        }
    }

    pub fn report_for(&self, name: &str) -> Option<&ProcessReport> {
        self.processes.iter().find(|p| p.name == name)
    }
}

/// Compares CPU usage between two snapshots against a baseline table.
///
/// Every baseline is evaluated even after the first failure so the report
/// is complete.
pub fn evaluate(
    first: &ProcessSnapshot,
    last: &ProcessSnapshot,
    baselines: &[Baseline],
) -> TrialOutcome {
    let dt = (last.log_mono_time as f64 - first.log_mono_time as f64) / NANOS_PER_SEC;
    if dt <= 0.0 {
        return TrialOutcome::aborted(TrialFailure::InvalidInterval { dt_secs: dt });
    }

    let processes = baselines
        .iter()
        .map(|baseline| ProcessReport {
            name: baseline.name.clone(),
            expected_percent: baseline.expected_cpu_percent,
            band: baseline.band(),
            outcome: measure(first, last, baseline, dt),
        })
        .collect();

    TrialOutcome::evaluated(dt, processes)
}

fn measure(
    first: &ProcessSnapshot,
    last: &ProcessSnapshot,
    baseline: &Baseline,
    dt: f64,
) -> ProcessOutcome {
    let (before, after) = match (first.find(&baseline.name), last.find(&baseline.name)) {
        (Some(before), Some(after)) => (before, after),
        (None, Some(_)) => {
            return ProcessOutcome::Missing {
                reason: MissingReason::AbsentFromFirst,
            }
        }
        (Some(_), None) => {
            return ProcessOutcome::Missing {
                reason: MissingReason::AbsentFromLast,
            }
        }
        (None, None) => {
            return ProcessOutcome::Missing {
                reason: MissingReason::AbsentFromBoth,
            }
        }
    };

    let cpu_time = after.total_cpu_time() - before.total_cpu_time();
    if cpu_time < 0.0 {
        return ProcessOutcome::Missing {
            reason: MissingReason::CounterReset,
        };
    }

    let measured_percent = cpu_time / dt * 100.0;
    match baseline.band().check(measured_percent) {
        None => ProcessOutcome::Within { measured_percent },
        Some(deviation) => ProcessOutcome::Regression {
            measured_percent,
            deviation,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ProcessStat;

    const SEC: u64 = 1_000_000_000;

    fn proc(name: &str, user: f64) -> ProcessStat {
        ProcessStat {
            pid: 0,
            name: String::new(),
            cmdline: vec![name.to_string()],
            cpu_user: user,
            cpu_system: 0.0,
            cpu_children_user: 0.0,
            cpu_children_system: 0.0,
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_measured_percent_is_delta_over_interval() {
        let first = ProcessSnapshot::new(0, vec![proc("./camerad", 3.0)]);
        let last = ProcessSnapshot::new(10 * SEC, vec![proc("./camerad", 10.0)]);
        let outcome = evaluate(&first, &last, &[Baseline::new("./camerad", 70.0)]);

        assert!(outcome.passed);
        assert_eq!(outcome.interval_secs, Some(10.0));
        let measured = outcome.processes[0].outcome.measured_percent().unwrap();
        assert!(approx(measured, 70.0));
    }

    #[test]
    fn test_all_four_counters_contribute() {
        let mut before = proc("./camerad", 1.0);
        before.cpu_system = 1.0;
        before.cpu_children_user = 1.0;
        before.cpu_children_system = 1.0;
        let mut after = before.clone();
        after.cpu_user += 0.5;
        after.cpu_system += 0.5;
        after.cpu_children_user += 0.5;
        after.cpu_children_system += 0.5;

        let outcome = evaluate(
            &ProcessSnapshot::new(0, vec![before]),
            &ProcessSnapshot::new(20 * SEC, vec![after]),
            &[Baseline::new("./camerad", 10.0)],
        );
        let measured = outcome.processes[0].outcome.measured_percent().unwrap();
        assert!(approx(measured, 10.0));
    }

    #[test]
    fn test_band_for_7_12() {
        let band = ToleranceBand::for_expected(7.12);
        assert!(approx(band.upper, 12.12));
        assert!(approx(band.lower, 4.628));

        assert_eq!(band.check(4.0), Some(Deviation::Below));
        assert_eq!(band.check(13.0), Some(Deviation::Above));
        assert_eq!(band.check(8.0), None);
    }

    #[test]
    fn test_band_for_3_5() {
        let band = ToleranceBand::for_expected(3.5);
        assert!(approx(band.upper, 8.5));
        assert!(approx(band.lower, 2.275));
    }

    #[test]
    fn test_band_for_large_and_zero_baselines() {
        let band = ToleranceBand::for_expected(100.0);
        assert!(approx(band.upper, 110.0));
        assert!(approx(band.lower, 65.0));

        let band = ToleranceBand::for_expected(0.0);
        assert!(approx(band.upper, 5.0));
        assert!(approx(band.lower, 0.0));
        assert_eq!(band.check(0.0), None);
    }

    #[test]
    fn test_band_edges_are_inclusive() {
        let band = ToleranceBand::for_expected(7.12);
        assert_eq!(band.check(band.upper), None);
        assert_eq!(band.check(band.lower), None);
    }

    #[test]
    fn test_regression_direction_is_reported() {
        // 10s window: 0.4s => 4%, 1.3s => 13%
        let first = ProcessSnapshot::new(0, vec![proc("low", 0.0), proc("high", 0.0)]);
        let last = ProcessSnapshot::new(10 * SEC, vec![proc("low", 0.4), proc("high", 1.3)]);
        let outcome = evaluate(
            &first,
            &last,
            &[Baseline::new("low", 7.12), Baseline::new("high", 7.12)],
        );

        assert!(!outcome.passed);
        assert!(matches!(
            outcome.report_for("low").unwrap().outcome,
            ProcessOutcome::Regression {
                deviation: Deviation::Below,
                ..
            }
        ));
        assert!(matches!(
            outcome.report_for("high").unwrap().outcome,
            ProcessOutcome::Regression {
                deviation: Deviation::Above,
                ..
            }
        ));
        assert_eq!(
            Deviation::Above.to_string(),
            "using more CPU than normal"
        );
    }

    #[test]
    fn test_missing_process_fails_but_others_still_evaluated() {
        let first = ProcessSnapshot::new(0, vec![proc("./camerad", 0.0)]);
        let last = ProcessSnapshot::new(10 * SEC, vec![proc("./camerad", 0.8)]);
        let outcome = evaluate(
            &first,
            &last,
            &[
                Baseline::new("./_dmonitoringmodeld", 3.5),
                Baseline::new("./camerad", 7.07),
            ],
        );

        assert!(!outcome.passed);
        assert_eq!(outcome.processes.len(), 2);
        assert_eq!(
            outcome.processes[0].outcome,
            ProcessOutcome::Missing {
                reason: MissingReason::AbsentFromBoth
            }
        );
        assert!(outcome.processes[1].outcome.is_ok());
        assert!(approx(
            outcome.processes[1].outcome.measured_percent().unwrap(),
            8.0
        ));
    }

    #[test]
    fn test_missing_from_one_side_only() {
        let first = ProcessSnapshot::new(0, vec![proc("a", 0.0)]);
        let last = ProcessSnapshot::new(SEC, vec![proc("b", 0.0)]);
        let outcome = evaluate(
            &first,
            &last,
            &[Baseline::new("a", 1.0), Baseline::new("b", 1.0)],
        );

        assert_eq!(
            outcome.report_for("a").unwrap().outcome,
            ProcessOutcome::Missing {
                reason: MissingReason::AbsentFromLast
            }
        );
        assert_eq!(
            outcome.report_for("b").unwrap().outcome,
            ProcessOutcome::Missing {
                reason: MissingReason::AbsentFromFirst
            }
        );
    }

    #[test]
    fn test_counter_reset_is_reported_as_missing() {
        let first = ProcessSnapshot::new(0, vec![proc("./camerad", 50.0)]);
        let last = ProcessSnapshot::new(10 * SEC, vec![proc("./camerad", 1.0)]);
        let outcome = evaluate(&first, &last, &[Baseline::new("./camerad", 7.07)]);

        assert!(!outcome.passed);
        assert_eq!(
            outcome.processes[0].outcome,
            ProcessOutcome::Missing {
                reason: MissingReason::CounterReset
            }
        );
    }

    #[test]
    fn test_non_positive_interval_is_invalid() {
        let snap = ProcessSnapshot::new(5 * SEC, vec![proc("./camerad", 1.0)]);
        let outcome = evaluate(&snap, &snap, &[Baseline::new("./camerad", 7.07)]);
        assert!(!outcome.passed);
        assert_eq!(
            outcome.failure,
            Some(TrialFailure::InvalidInterval { dt_secs: 0.0 })
        );

        let earlier = ProcessSnapshot::new(SEC, vec![proc("./camerad", 1.0)]);
        let outcome = evaluate(&snap, &earlier, &[Baseline::new("./camerad", 7.07)]);
        assert!(matches!(
            outcome.failure,
            Some(TrialFailure::InvalidInterval { dt_secs }) if dt_secs < 0.0
        ));
    }

    #[test]
    fn test_evaluate_is_order_independent() {
        let first = ProcessSnapshot::new(
            0,
            vec![proc("a", 0.0), proc("b", 0.0), proc("c", 0.0)],
        );
        let last = ProcessSnapshot::new(
            20 * SEC,
            vec![proc("a", 1.0), proc("b", 4.0), proc("c", 0.1)],
        );
        let forward = vec![
            Baseline::new("a", 5.0),
            Baseline::new("b", 20.0),
            Baseline::new("c", 3.0),
        ];
        let mut reversed = forward.clone();
        reversed.reverse();

        let one = evaluate(&first, &last, &forward);
        let two = evaluate(&first, &last, &reversed);

        assert_eq!(one.passed, two.passed);
        for baseline in &forward {
            assert_eq!(
                one.report_for(&baseline.name).unwrap().outcome,
                two.report_for(&baseline.name).unwrap().outcome
            );
        }
    }

    #[test]
    fn test_empty_baseline_table_passes() {
        let first = ProcessSnapshot::new(0, vec![]);
        let last = ProcessSnapshot::new(SEC, vec![]);
        let outcome = evaluate(&first, &last, &[]);
        assert!(outcome.passed);
        assert!(outcome.processes.is_empty());
    }
}
