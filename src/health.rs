use crate::prelude::*;

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Starting,
    Serving,
    Failed,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthState::Starting => "STARTING",
            HealthState::Serving => "SERVING",
            HealthState::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub state: HealthState,
    /// Required roles that caused `Failed`; empty in any other state.
    pub failing_roles: Vec<Role>,
}

impl HealthReport {
    pub fn starting() -> Self {
        Self {
            state: HealthState::Starting,
            failing_roles: Vec::new(),
        }
    }

    pub fn is_serving(&self) -> bool {
        self.state == HealthState::Serving
    }
}

/// Outcome of one evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub report: HealthReport,
    /// Whether the cycle may publish a freshly encoded image.
    pub publish: bool,
    /// Set when the state changed on this evaluation.
    pub transition: Option<(HealthState, HealthState)>,
}

/// Edge-triggered serving/failed state machine over the required roles.
///
/// With `failure_threshold == 1` every failing evaluation fails the meter at
/// once. Larger thresholds hold `Serving` (without publishing) until that
/// many consecutive evaluations have failed. Recovery is always immediate.
#[derive(Clone, Debug)]
pub struct HealthMonitor {
    report: HealthReport,
    failure_threshold: u32,
    consecutive_failures: u32,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(1)
    }
}

impl HealthMonitor {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            report: HealthReport::starting(),
            failure_threshold: failure_threshold.max(1),
            consecutive_failures: 0,
        }
    }

    pub fn state(&self) -> HealthState {
        self.report.state
    }

    /// Feeds one cycle's set of required roles that did not resolve to a
    /// valid value.
    pub fn evaluate(&mut self, failing_roles: Vec<Role>) -> Verdict {
        let previous = self.report.state;

        let publish = if failing_roles.is_empty() {
            self.consecutive_failures = 0;
            self.report = HealthReport {
                state: HealthState::Serving,
                failing_roles,
            };
            true
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);

            if previous == HealthState::Serving
                && self.consecutive_failures < self.failure_threshold
            {
                debug!(
                    "required roles {:?} failing ({}/{}), holding last snapshot",
                    failing_roles, self.consecutive_failures, self.failure_threshold
                );
            } else {
                self.report = HealthReport {
                    state: HealthState::Failed,
                    failing_roles,
                };
            }
            false
        };

        let current = self.report.state;
        Verdict {
            report: self.report.clone(),
            publish,
            transition: (previous != current).then_some((previous, current)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starting_is_left_on_first_evaluation() {
        let mut monitor = HealthMonitor::default();
        assert_eq!(monitor.state(), HealthState::Starting);

        let verdict = monitor.evaluate(vec![Role::Frequency]);
        assert_eq!(verdict.report.state, HealthState::Failed);
        assert_eq!(verdict.report.failing_roles, vec![Role::Frequency]);
        assert_eq!(
            verdict.transition,
            Some((HealthState::Starting, HealthState::Failed))
        );
        assert!(!verdict.publish);

        let mut monitor = HealthMonitor::new(5);
        let verdict = monitor.evaluate(vec![Role::VoltageL1]);
        assert_eq!(verdict.report.state, HealthState::Failed);
    }

    #[test]
    fn flaps_without_debounce() {
        let mut monitor = HealthMonitor::default();

        assert!(monitor.evaluate(vec![]).publish);
        assert_eq!(monitor.state(), HealthState::Serving);

        let verdict = monitor.evaluate(vec![Role::VoltageL1]);
        assert_eq!(
            verdict.transition,
            Some((HealthState::Serving, HealthState::Failed))
        );

        let verdict = monitor.evaluate(vec![]);
        assert!(verdict.publish);
        assert!(verdict.report.failing_roles.is_empty());
        assert_eq!(
            verdict.transition,
            Some((HealthState::Failed, HealthState::Serving))
        );

        let verdict = monitor.evaluate(vec![]);
        assert_eq!(verdict.transition, None);
    }

    #[test]
    fn threshold_holds_serving_without_publishing() {
        let mut monitor = HealthMonitor::new(3);
        monitor.evaluate(vec![]);

        for _ in 0..2 {
            let verdict = monitor.evaluate(vec![Role::PowerTotal]);
            assert_eq!(verdict.report.state, HealthState::Serving);
            assert!(verdict.report.failing_roles.is_empty());
            assert!(!verdict.publish);
        }

        let verdict = monitor.evaluate(vec![Role::PowerTotal]);
        assert_eq!(verdict.report.state, HealthState::Failed);

        // a single good evaluation recovers and resets the counter
        assert!(monitor.evaluate(vec![]).publish);
        let verdict = monitor.evaluate(vec![Role::PowerTotal]);
        assert_eq!(verdict.report.state, HealthState::Serving);
    }
}
