//! Registration retry bookkeeping.
//!
//! A failed registration is not fatal: the task keeps running and the
//! controller retries on a later tick once the backoff for that task has
//! elapsed.

use std::collections::HashMap;

use shoal_state::{Backoff, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    attempts: u32,
    next_attempt_at: u64,
}

/// Per-task registration attempt counters with exponential backoff.
#[derive(Debug, Clone, Default)]
pub struct RegistrationRetry {
    backoff: Backoff,
    pending: HashMap<TaskId, Pending>,
}

impl RegistrationRetry {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            pending: HashMap::new(),
        }
    }

    /// Whether a registration attempt for `task_id` may be made at `now`.
    pub fn is_due(&self, task_id: &str, now: u64) -> bool {
        self.pending
            .get(task_id)
            .is_none_or(|p| now >= p.next_attempt_at)
    }

    /// Record a failed attempt. Returns the attempt number (1-based).
    pub fn record_failure(&mut self, task_id: &str, now: u64) -> u32 {
        let entry = self.pending.entry(task_id.to_string()).or_insert(Pending {
            attempts: 0,
            next_attempt_at: now,
        });
        entry.attempts += 1;
        entry.next_attempt_at = self.backoff.next_attempt_at(now, entry.attempts);
        entry.attempts
    }

    /// Clear the counter after a successful registration.
    pub fn record_success(&mut self, task_id: &str) {
        self.pending.remove(task_id);
    }

    /// Drop bookkeeping for a task that is going away.
    pub fn forget(&mut self, task_id: &str) {
        self.pending.remove(task_id);
    }

    /// Failed attempts so far for a task.
    pub fn attempts(&self, task_id: &str) -> u32 {
        self.pending.get(task_id).map_or(0, |p| p.attempts)
    }

    pub fn next_attempt_at(&self, task_id: &str) -> Option<u64> {
        self.pending.get(task_id).map(|p| p.next_attempt_at)
    }
}
