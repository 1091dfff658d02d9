//! shoal-balancer: load balancer binding for Shoal.
//!
//! Abstracts the externally owned traffic-routing component that fronts a
//! service. The controller registers a task's endpoint once the task is
//! healthy and deregisters it before the task is stopped so in-flight
//! connections can drain.
//!
//! # Components
//!
//! - **`binding`**: the `TargetBinding` trait and its error type
//! - **`targets`**: `TargetGroup`, an in-memory binding with round-robin selection
//! - **`retry`**: per-task registration retry bookkeeping with backoff
//!
//! Registration failures are soft: they never block launch or stop
//! decisions, they are retried on later ticks.

pub mod binding;
pub mod retry;
pub mod targets;

pub use binding::{BindingError, TargetBinding};
pub use retry::RegistrationRetry;
pub use targets::{Target, TargetGroup};
