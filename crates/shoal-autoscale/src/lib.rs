//! shoal-autoscale: target-tracking scaling of a service's desired count.
//!
//! Compares a load metric against the policy's target value and proposes a
//! new desired count, clamped to the policy bounds. Cooldown windows
//! suppress writes that follow the previous write too closely.
//!
//! # Scaling Algorithm
//!
//! ```text
//! raw     = ceil(current_desired * metric / target)
//! desired = clamp(raw, min_capacity, max_capacity)
//!
//! desired == current            → NoChange
//! within cooldown of last write → CoolingDown
//! otherwise                     → ScaleTo(desired)
//! ```
//!
//! Scale-out and scale-in use their own cooldowns, both measured from the
//! last successful write in either direction. A missing metric skips the
//! cycle and keeps the current desired count.

pub mod metric;
pub mod scaler;

pub use metric::{ManualMetrics, MetricSource, MetricUnavailable};
pub use scaler::{ScaleDecision, ScaleDirection, ScaleState, evaluate};
