//! Health book: the trackers of one service and the concurrent probe runner.
//!
//! The book is owned by the service's state and only touched under the
//! service lock. Probing itself happens outside the lock: the caller takes
//! the due targets, releases the lock, runs [`probe_all`], then re-locks and
//! feeds the results back through [`HealthBook::record`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error};

use shoal_state::{EventKind, HealthProbeSpec, TaskId, TaskState};

use crate::checker::{HealthStatus, HealthTracker};
use crate::probe::{HealthProbe, ProbeResult, ProbeTarget, run_probe};

/// A health status change for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub task_id: TaskId,
    pub status: HealthStatus,
    pub failures: u32,
}

impl HealthTransition {
    pub fn task_state(&self) -> TaskState {
        self.status.task_state()
    }

    /// The deployment event describing this transition.
    ///
    /// `None` for `Starting`, which trackers never transition back to.
    pub fn event_kind(&self) -> Option<EventKind> {
        match self.status {
            HealthStatus::Healthy => Some(EventKind::TaskHealthy {
                task_id: self.task_id.clone(),
            }),
            HealthStatus::Unhealthy => Some(EventKind::TaskUnhealthy {
                task_id: self.task_id.clone(),
                failures: self.failures,
            }),
            HealthStatus::Starting => None,
        }
    }
}

/// Health trackers for the running tasks of one service.
#[derive(Debug, Default)]
pub struct HealthBook {
    trackers: HashMap<TaskId, HealthTracker>,
}

impl HealthBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a task that began running at `running_since`.
    pub fn watch(&mut self, task_id: &str, spec: &HealthProbeSpec, running_since: u64) {
        self.trackers
            .insert(task_id.to_string(), HealthTracker::new(spec, running_since));
        debug!(%task_id, "health tracking started");
    }

    /// Resume tracking a task loaded from the store.
    pub fn restore(
        &mut self,
        task_id: &str,
        spec: &HealthProbeSpec,
        state: TaskState,
        failures: u32,
        now: u64,
    ) {
        self.trackers.insert(
            task_id.to_string(),
            HealthTracker::restored(spec, state, failures, now),
        );
    }

    /// Stop tracking a task (stopping, stopped or gone).
    pub fn forget(&mut self, task_id: &str) {
        self.trackers.remove(task_id);
    }

    pub fn get(&self, task_id: &str) -> Option<&HealthTracker> {
        self.trackers.get(task_id)
    }

    pub fn is_watching(&self, task_id: &str) -> bool {
        self.trackers.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    /// Tasks whose next probe is due at `now`, in id order.
    pub fn due(&self, now: u64) -> Vec<TaskId> {
        let mut due: Vec<TaskId> = self
            .trackers
            .iter()
            .filter(|(_, t)| t.is_due(now))
            .map(|(id, _)| id.clone())
            .collect();
        due.sort();
        due
    }

    /// Feed a probe result back. Results for tasks no longer tracked are
    /// dropped.
    pub fn record(
        &mut self,
        task_id: &str,
        now: u64,
        result: ProbeResult,
    ) -> Option<HealthTransition> {
        let tracker = self.trackers.get_mut(task_id)?;
        let status = tracker.record(now, result)?;
        Some(HealthTransition {
            task_id: task_id.to_string(),
            status,
            failures: tracker.consecutive_failures(),
        })
    }

    /// Current consecutive failure count for a task.
    pub fn failures(&self, task_id: &str) -> u32 {
        self.trackers
            .get(task_id)
            .map(HealthTracker::consecutive_failures)
            .unwrap_or(0)
    }
}

/// Probe all targets concurrently, each bounded by its own timeout.
pub async fn probe_all(
    probe: Arc<dyn HealthProbe>,
    targets: Vec<ProbeTarget>,
) -> Vec<(TaskId, ProbeResult)> {
    let mut set = JoinSet::new();
    for target in targets {
        let probe = Arc::clone(&probe);
        set.spawn(async move {
            let result = run_probe(probe.as_ref(), &target).await;
            (target.task_id, result)
        });
    }

    let mut results = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(pair) => results.push(pair),
            Err(e) => error!(error = %e, "health probe task panicked"),
        }
    }
    results.sort_by(|a, b| a.0.cmp(&b.0));
    results
}
