//! shoal-health: per-task health checking for Shoal.
//!
//! Runs the probe command of a task definition against each running task
//! and turns the results into health transitions. The checker never starts
//! or stops tasks; the service controller decides what to do with an
//! unhealthy task (it always replaces it).
//!
//! # Architecture
//!
//! ```text
//! HealthBook (one per service)
//!   ├── HealthTracker per running task
//!   │   ├── start-period grace, fixed probe cadence
//!   │   └── consecutive failures → Unhealthy after `retries`
//!   └── due(now) → [TaskId]
//! probe_all(HealthProbe, targets) → [(TaskId, ProbeResult)]
//!   └── each probe bounded by the definition's timeout
//! ```
//!
//! A single successful probe restores `Healthy` and resets the counter.

pub mod checker;
pub mod monitor;
pub mod probe;

pub use checker::{HealthStatus, HealthTracker};
pub use monitor::{HealthBook, HealthTransition, probe_all};
pub use probe::{CommandProbe, HealthProbe, ProbeResult, ProbeTarget, run_probe};
