//! Controller timing and retry settings.

use std::time::Duration;

use shoal_state::Backoff;

/// How often each per-service worker runs its passes, and how launch and
/// registration retries back off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Reconciliation tick.
    pub tick_interval: Duration,
    /// How often due health probes are collected. Per-task cadence comes
    /// from the task definition; this only bounds the scheduling jitter.
    pub health_interval: Duration,
    /// Auto scaler evaluation period.
    pub autoscale_interval: Duration,
    /// Consecutive launch failures before the rollout is stalled.
    pub max_launch_attempts: u32,
    pub launch_backoff: Backoff,
    pub registration_backoff: Backoff,
    /// How long a deregistered task keeps running before the runtime is
    /// asked to stop it, so in-flight connections can finish.
    pub drain: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(2),
            health_interval: Duration::from_secs(1),
            autoscale_interval: Duration::from_secs(60),
            max_launch_attempts: 5,
            launch_backoff: Backoff::default(),
            registration_backoff: Backoff::default(),
            drain: Duration::from_secs(5),
        }
    }
}
