//! Health tracking for a single task.
//!
//! A tracker is created when its task is observed running. It holds back
//! the first probe until the start period is over, then schedules one probe
//! per interval on a fixed cadence and counts consecutive failures.

use tracing::{debug, warn};

use shoal_state::{HealthProbeSpec, TaskState};

use crate::probe::ProbeResult;

/// Health verdict of a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Running, no probe has succeeded yet.
    Starting,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    /// The task lifecycle state this verdict maps to.
    pub fn task_state(self) -> TaskState {
        match self {
            HealthStatus::Starting => TaskState::Running,
            HealthStatus::Healthy => TaskState::Healthy,
            HealthStatus::Unhealthy => TaskState::Unhealthy,
        }
    }
}

/// Tracks consecutive probe results for a single task.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    /// Failures before marking unhealthy.
    retries: u32,
    interval_ms: u64,
    /// Epoch millis at which the next probe is due.
    next_probe_at: u64,
}

impl HealthTracker {
    /// Start tracking a task that began running at `running_since`.
    ///
    /// The first probe is due once the start period has elapsed.
    pub fn new(spec: &HealthProbeSpec, running_since: u64) -> Self {
        Self {
            status: HealthStatus::Starting,
            consecutive_failures: 0,
            retries: spec.retries.max(1),
            interval_ms: spec.interval.as_millis() as u64,
            next_probe_at: running_since + spec.start_period.as_millis() as u64,
        }
    }

    /// Resume tracking a task loaded from the store.
    ///
    /// Grace is not granted again; the next probe is due immediately.
    pub fn restored(spec: &HealthProbeSpec, state: TaskState, failures: u32, now: u64) -> Self {
        let status = match state {
            TaskState::Healthy => HealthStatus::Healthy,
            TaskState::Unhealthy => HealthStatus::Unhealthy,
            _ => HealthStatus::Starting,
        };
        Self {
            status,
            consecutive_failures: failures,
            retries: spec.retries.max(1),
            interval_ms: spec.interval.as_millis() as u64,
            next_probe_at: now,
        }
    }

    /// Whether a probe should run at `now`.
    pub fn is_due(&self, now: u64) -> bool {
        now >= self.next_probe_at
    }

    pub fn next_probe_at(&self) -> u64 {
        self.next_probe_at
    }

    /// Record a probe result taken at `now`.
    ///
    /// Returns the new status if this result changed it.
    pub fn record(&mut self, now: u64, result: ProbeResult) -> Option<HealthStatus> {
        // Keep the cadence anchored to the schedule unless we fell behind it.
        let scheduled = self.next_probe_at + self.interval_ms;
        self.next_probe_at = if scheduled > now {
            scheduled
        } else {
            now + self.interval_ms
        };

        let previous = self.status;
        if result.is_success() {
            self.consecutive_failures = 0;
            self.status = HealthStatus::Healthy;
            if previous != HealthStatus::Healthy {
                debug!(?previous, "task became healthy");
            }
        } else {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= self.retries && previous != HealthStatus::Unhealthy {
                warn!(
                    failures = self.consecutive_failures,
                    retries = self.retries,
                    ?result,
                    "task marked unhealthy"
                );
                self.status = HealthStatus::Unhealthy;
            }
        }

        (self.status != previous).then_some(self.status)
    }

    /// Current health status.
    pub fn status(&self) -> HealthStatus {
        self.status
    }

    /// Current number of consecutive failures.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether this task needs replacement.
    pub fn needs_replacement(&self) -> bool {
        self.status == HealthStatus::Unhealthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SEC: u64 = 1_000;

    fn spec(retries: u32) -> HealthProbeSpec {
        HealthProbeSpec {
            command: vec!["true".to_string()],
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            retries,
            start_period: Duration::from_secs(60),
        }
    }

    #[test]
    fn tracker_starts_in_grace() {
        let tracker = HealthTracker::new(&spec(3), 0);
        assert_eq!(tracker.status(), HealthStatus::Starting);
        assert!(!tracker.is_due(59 * SEC + 999));
        assert!(tracker.is_due(60 * SEC));
    }

    #[test]
    fn three_failures_after_grace_flip_to_unhealthy_at_120s() {
        let mut tracker = HealthTracker::new(&spec(3), 0);

        assert_eq!(tracker.record(60 * SEC, ProbeResult::Failed), None);
        assert_eq!(tracker.next_probe_at(), 90 * SEC);
        assert_eq!(tracker.record(90 * SEC, ProbeResult::TimedOut), None);
        assert_eq!(tracker.next_probe_at(), 120 * SEC);
        assert_eq!(
            tracker.record(120 * SEC, ProbeResult::Unhealthy { exit_code: Some(1) }),
            Some(HealthStatus::Unhealthy)
        );
        assert!(tracker.needs_replacement());
    }

    #[test]
    fn healthy_to_unhealthy_takes_exactly_retries_failures() {
        let mut tracker = HealthTracker::new(&spec(3), 0);
        assert_eq!(
            tracker.record(60 * SEC, ProbeResult::Healthy),
            Some(HealthStatus::Healthy)
        );

        let mut now = 60 * SEC;
        for _ in 0..2 {
            now += 30 * SEC;
            assert_eq!(tracker.record(now, ProbeResult::Failed), None);
            assert_eq!(tracker.status(), HealthStatus::Healthy);
        }
        now += 30 * SEC;
        assert_eq!(
            tracker.record(now, ProbeResult::Failed),
            Some(HealthStatus::Unhealthy)
        );

        // Further failures do not re-announce the transition.
        now += 30 * SEC;
        assert_eq!(tracker.record(now, ProbeResult::Failed), None);
        assert_eq!(tracker.consecutive_failures(), 4);
    }

    #[test]
    fn success_resets_failure_counter() {
        let mut tracker = HealthTracker::new(&spec(3), 0);
        tracker.record(60 * SEC, ProbeResult::Failed);
        tracker.record(90 * SEC, ProbeResult::Failed);
        tracker.record(120 * SEC, ProbeResult::Healthy);
        assert_eq!(tracker.consecutive_failures(), 0);

        tracker.record(150 * SEC, ProbeResult::Failed);
        tracker.record(180 * SEC, ProbeResult::Failed);
        assert_eq!(tracker.status(), HealthStatus::Healthy);
    }

    #[test]
    fn single_success_recovers_from_unhealthy() {
        let mut tracker = HealthTracker::new(&spec(1), 0);
        assert_eq!(
            tracker.record(60 * SEC, ProbeResult::Failed),
            Some(HealthStatus::Unhealthy)
        );
        assert_eq!(
            tracker.record(90 * SEC, ProbeResult::Healthy),
            Some(HealthStatus::Healthy)
        );
        assert!(!tracker.needs_replacement());
    }

    #[test]
    fn late_probe_reschedules_from_now() {
        let mut tracker = HealthTracker::new(&spec(3), 0);
        tracker.record(200 * SEC, ProbeResult::Healthy);
        assert_eq!(tracker.next_probe_at(), 230 * SEC);
    }

    #[test]
    fn restored_tracker_probes_immediately() {
        let tracker = HealthTracker::restored(&spec(3), TaskState::Healthy, 1, 5_000 * SEC);
        assert_eq!(tracker.status(), HealthStatus::Healthy);
        assert_eq!(tracker.consecutive_failures(), 1);
        assert!(tracker.is_due(5_000 * SEC));
    }

    #[test]
    fn status_maps_to_task_state() {
        assert_eq!(HealthStatus::Starting.task_state(), TaskState::Running);
        assert_eq!(HealthStatus::Unhealthy.task_state(), TaskState::Unhealthy);
    }
}
