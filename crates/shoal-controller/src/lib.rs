//! shoal-controller: rolling-update reconciliation for Shoal services.
//!
//! Keeps each service converged on its desired count and target task
//! definition version without breaking its rolling-update bounds, gated by
//! live health checks and resized by the autoscaler.
//!
//! # Components
//!
//! - **`plan`**: pure planner deciding launches and stops for one tick
//! - **`controller`**: `ServiceController`, carries out one tick against the runtime and load balancer
//! - **`fleet`**: `Fleet`, owns all services behind per-service locks and runs their workers
//! - **`events`**: persisted, broadcast deployment event log
//! - **`runtime`**: the `TaskRuntime` trait task processes are launched through

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod fleet;
pub mod plan;
pub mod runtime;
pub mod state;

pub use config::ControllerConfig;
pub use controller::{ServiceController, TickReport};
pub use error::{FleetError, FleetResult};
pub use events::EventLog;
pub use fleet::{CreateService, Fleet, FleetParts, ServiceHandle, ServiceSnapshot, ServiceUpdate};
pub use plan::{Counts, Plan, StopReason};
pub use runtime::{RuntimeError, RuntimeStatus, TaskRuntime};
pub use state::{LaunchRetry, ServiceState};
