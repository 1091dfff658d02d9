//! Rollout planning: what one reconciliation tick should do.
//!
//! The planner is pure: it looks at the service's active tasks and returns
//! how many tasks to launch and which to stop. The controller carries the
//! plan out and observes the results on later ticks.
//!
//! # Rules
//!
//! ```text
//! max_total   = ceil(desired × max_percent / 100)
//! min_healthy = ceil(desired × min_healthy_percent / 100)
//! floor       = floor(desired × min_healthy_percent / 100)
//!
//! launch  min(max_total − total, desired − current)   while current healthy < desired
//! drain   every old task                               once current healthy ≥ min_healthy
//! room    old tasks, keeping ≥ floor healthy overall   when launches are blocked by max_total
//! trim    surplus current tasks, unhealthy then newest when current > desired
//! ```
//!
//! Stopping tasks still count toward `total` until their process exits.

use std::cmp::Reverse;
use std::fmt;

use shoal_state::{RollingUpdatePolicy, Task, TaskId, TaskState, Version};

/// Why the controller stops a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Old version, replaced by healthy current-version tasks.
    Superseded,
    /// Old version, stopped early so a replacement fits under `max_total`.
    MakeRoom,
    /// Current version, more tasks than desired.
    ScaleIn,
    /// Failed its health checks.
    Unhealthy,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Superseded => "superseded",
            StopReason::MakeRoom => "make-room",
            StopReason::ScaleIn => "scale-in",
            StopReason::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Actions for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// New target-version tasks to launch.
    pub launch: u32,
    /// Tasks to deregister and stop, in order.
    pub stop: Vec<(TaskId, StopReason)>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.launch == 0 && self.stop.is_empty()
    }
}

/// Task counts relative to the target version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    /// Live target-version tasks.
    pub current: u32,
    pub current_healthy: u32,
    /// Live tasks of any other version.
    pub old: u32,
    pub old_healthy: u32,
    /// Tasks draining toward exit.
    pub stopping: u32,
}

impl Counts {
    pub fn of<'a>(tasks: impl IntoIterator<Item = &'a Task>, target: Version) -> Self {
        let mut counts = Counts::default();
        for task in tasks {
            let healthy = task.state == TaskState::Healthy;
            match task.state {
                TaskState::Stopped => {}
                TaskState::Stopping => counts.stopping += 1,
                _ if task.version == target => {
                    counts.current += 1;
                    counts.current_healthy += u32::from(healthy);
                }
                _ => {
                    counts.old += 1;
                    counts.old_healthy += u32::from(healthy);
                }
            }
        }
        counts
    }

    /// Tasks that count against `max_total`.
    pub fn total(&self) -> u32 {
        self.current + self.old + self.stopping
    }
}

/// Plan one tick for a service.
///
/// `can_launch` is false while launches are backing off or stalled; the
/// drain rules still apply.
pub fn plan(
    desired: u32,
    target: Version,
    policy: &RollingUpdatePolicy,
    tasks: &[Task],
    can_launch: bool,
) -> Plan {
    let counts = Counts::of(tasks, target);
    let max_total = policy.max_total(desired);
    let min_healthy = policy.min_healthy(desired);
    let total = counts.total();
    let mut plan = Plan::default();

    if can_launch && counts.current_healthy < desired && total < max_total {
        plan.launch = (max_total - total).min(desired.saturating_sub(counts.current));
    }

    let mut old: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.state.is_live() && t.version != target)
        .collect();
    // Tasks not carrying traffic go first, then oldest launch.
    old.sort_by_key(|t| (is_healthy(t), t.launched_at, t.id.clone()));

    if counts.current_healthy >= min_healthy {
        plan.stop
            .extend(old.iter().map(|t| (t.id.clone(), StopReason::Superseded)));
    } else if !old.is_empty() && counts.current < desired && total >= max_total {
        let room = max_total.saturating_sub(total);
        let want = (desired - counts.current)
            .saturating_sub(room)
            .saturating_sub(counts.stopping);
        let floor = policy.healthy_floor(desired);
        let mut healthy_left = counts.current_healthy + counts.old_healthy;
        for task in old.iter().take(want as usize) {
            if is_healthy(task) {
                if healthy_left <= floor {
                    break;
                }
                healthy_left -= 1;
            }
            plan.stop.push((task.id.clone(), StopReason::MakeRoom));
        }
    }

    if counts.current > desired {
        let mut current: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.state.is_live() && t.version == target)
            .collect();
        current.sort_by_key(|t| (is_healthy(t), Reverse(t.launched_at), Reverse(t.id.clone())));

        let mut healthy_left = counts.current_healthy;
        for task in current.iter().take((counts.current - desired) as usize) {
            if is_healthy(task) {
                if healthy_left <= min_healthy {
                    break;
                }
                healthy_left -= 1;
            }
            plan.stop.push((task.id.clone(), StopReason::ScaleIn));
        }
    }

    plan
}

/// The service runs exactly `desired` healthy target-version tasks and
/// nothing else.
pub fn is_converged(desired: u32, target: Version, tasks: &[Task]) -> bool {
    let counts = Counts::of(tasks, target);
    counts.old == 0
        && counts.stopping == 0
        && counts.current == desired
        && counts.current_healthy == desired
}

fn is_healthy(task: &Task) -> bool {
    task.state == TaskState::Healthy
}
