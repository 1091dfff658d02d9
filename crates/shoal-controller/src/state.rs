//! Mutable state of one service, guarded by its service lock.

use std::collections::{BTreeMap, BTreeSet};

use shoal_autoscale::ScaleState;
use shoal_balancer::RegistrationRetry;
use shoal_health::HealthBook;
use shoal_state::{Backoff, RolloutStatus, Service, Task, TaskId, TaskState};

/// Consecutive launch failures of a service and the backoff between them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaunchRetry {
    attempts: u32,
    next_attempt_at: u64,
}

impl LaunchRetry {
    pub fn is_due(&self, now: u64) -> bool {
        now >= self.next_attempt_at
    }

    /// Record a failed launch. Returns the consecutive failure count.
    pub fn record_failure(&mut self, now: u64, backoff: &Backoff) -> u32 {
        self.attempts += 1;
        self.next_attempt_at = backoff.next_attempt_at(now, self.attempts);
        self.attempts
    }

    /// A task reached RUNNING, or an operator cleared the stall.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Everything the controller mutates for one service.
///
/// Only ever accessed under the service's `tokio::sync::Mutex`, so the
/// controller tick, health recording, autoscaler writes and operator
/// updates are serialized.
#[derive(Debug)]
pub struct ServiceState {
    pub service: Service,
    /// Active tasks by id. Stopped tasks are removed.
    pub tasks: BTreeMap<TaskId, Task>,
    pub health: HealthBook,
    pub launches: LaunchRetry,
    pub registrations: RegistrationRetry,
    pub scale: ScaleState,
    /// Stopping tasks whose stop request the runtime rejected.
    pub(crate) stop_retry: BTreeSet<TaskId>,
    /// Deregistered tasks waiting out the drain delay, with the time their
    /// stop is due.
    pub(crate) draining: BTreeMap<TaskId, u64>,
    /// Tasks removed since the last successful save.
    pub(crate) removed: Vec<TaskId>,
}

impl ServiceState {
    pub fn new(service: Service, registration_backoff: Backoff) -> Self {
        Self {
            service,
            tasks: BTreeMap::new(),
            health: HealthBook::new(),
            launches: LaunchRetry::default(),
            registrations: RegistrationRetry::new(registration_backoff),
            scale: ScaleState::new(),
            stop_retry: BTreeSet::new(),
            draining: BTreeMap::new(),
            removed: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.service.id
    }

    pub fn is_stalled(&self) -> bool {
        matches!(self.service.rollout, RolloutStatus::Stalled { .. })
    }

    /// Active tasks in id order.
    pub fn task_list(&self) -> Vec<Task> {
        self.tasks.values().cloned().collect()
    }

    pub fn insert_task(&mut self, task: Task) {
        self.service.task_ids.push(task.id.clone());
        self.tasks.insert(task.id.clone(), task);
    }

    /// Drop a stopped task from every index.
    pub fn remove_task(&mut self, task_id: &str) -> Option<Task> {
        let task = self.tasks.remove(task_id)?;
        self.service.task_ids.retain(|id| id != task_id);
        self.health.forget(task_id);
        self.registrations.forget(task_id);
        self.stop_retry.remove(task_id);
        self.draining.remove(task_id);
        self.removed.push(task.id.clone());
        Some(task)
    }

    /// Ids of tasks currently in `state`.
    pub fn ids_in(&self, state: TaskState) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.state == state)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Whether a draining task has reached its stop time.
    pub(crate) fn drain_elapsed(&self, task_id: &str, now: u64) -> bool {
        self.draining.get(task_id).is_some_and(|&at| now >= at)
    }

    /// Hand the removed ids to `save`. They are only forgotten once the save
    /// succeeds; a failed save leaves them for the next attempt.
    pub(crate) fn flush_removed<E>(
        &mut self,
        save: impl FnOnce(&[TaskId]) -> Result<(), E>,
    ) -> Result<(), E> {
        save(&self.removed)?;
        self.removed.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use shoal_state::RollingUpdatePolicy;

    fn service() -> Service {
        Service {
            id: "web".to_string(),
            desired_count: 2,
            target_version: 1,
            rolling_policy: RollingUpdatePolicy::default(),
            scaling_policy: None,
            task_ids: Vec::new(),
            rollout: RolloutStatus::InProgress,
            next_task_seq: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn launch_retry_backs_off_and_resets() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut retry = LaunchRetry::default();
        assert!(retry.is_due(0));

        assert_eq!(retry.record_failure(10_000, &backoff), 1);
        assert!(!retry.is_due(10_999));
        assert!(retry.is_due(11_000));
        assert_eq!(retry.record_failure(11_000, &backoff), 2);
        assert!(retry.is_due(13_000));

        retry.reset();
        assert_eq!(retry.attempts(), 0);
        assert!(retry.is_due(0));
    }

    #[test]
    fn insert_and_remove_keep_indexes_in_step() {
        let mut st = ServiceState::new(service(), Backoff::default());
        let id = st.service.next_task_id();
        st.insert_task(Task::new(id.clone(), "web", 1, 0));
        assert_eq!(st.service.task_ids, vec![id.clone()]);
        assert_eq!(st.ids_in(TaskState::Pending), vec![id.clone()]);

        assert!(st.remove_task(&id).is_some());
        assert!(st.service.task_ids.is_empty());
        assert_eq!(st.removed, vec![id.clone()]);
        assert!(st.remove_task(&id).is_none());
    }

    #[test]
    fn removed_ids_survive_a_failed_save() {
        let mut st = ServiceState::new(service(), Backoff::default());
        let id = st.service.next_task_id();
        st.insert_task(Task::new(id.clone(), "web", 1, 0));
        st.remove_task(&id);

        let failed: Result<(), &str> = st.flush_removed(|_| Err("disk full"));
        assert_eq!(failed, Err("disk full"));
        assert_eq!(st.removed, vec![id.clone()]);

        let mut saved = Vec::new();
        st.flush_removed(|ids| {
            saved = ids.to_vec();
            Ok::<(), &str>(())
        })
        .unwrap();
        assert_eq!(saved, vec![id]);
        assert!(st.removed.is_empty());
    }

    #[test]
    fn removing_a_task_ends_its_drain() {
        let mut st = ServiceState::new(service(), Backoff::default());
        let id = st.service.next_task_id();
        st.insert_task(Task::new(id.clone(), "web", 1, 0));
        st.draining.insert(id.clone(), 5_000);

        assert!(!st.drain_elapsed(&id, 4_999));
        assert!(st.drain_elapsed(&id, 5_000));
        st.remove_task(&id);
        assert!(!st.drain_elapsed(&id, 9_000));
    }
}
