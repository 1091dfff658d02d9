//! Task runtime contract.
//!
//! Launch and stop are fire-and-observe: they submit work and return, and
//! the controller learns the outcome by polling `status` on later ticks.

use async_trait::async_trait;
use thiserror::Error;

use shoal_state::{Endpoint, Task, TaskDefinition};

/// A launch or stop request the runtime could not accept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("insufficient capacity: {0}")]
    Capacity(String),

    #[error("image unavailable: {0}")]
    Image(String),

    #[error("runtime failure: {0}")]
    Other(String),
}

/// What the runtime knows about a task's process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeStatus {
    /// Accepted, not started yet.
    Pending,
    /// The process is up and serving on `endpoint`.
    Running { endpoint: Endpoint },
    /// The process ended (or never started).
    Exited { code: Option<i32> },
    /// The runtime has no record of the task.
    Unknown,
}

/// Runs task processes. Every operation must be safe to repeat: launching
/// a known task id, or stopping a stopped one, is a no-op.
#[async_trait]
pub trait TaskRuntime: Send + Sync {
    async fn launch(&self, task: &Task, definition: &TaskDefinition) -> Result<(), RuntimeError>;

    async fn status(&self, task: &Task) -> Result<RuntimeStatus, RuntimeError>;

    async fn stop(&self, task: &Task) -> Result<(), RuntimeError>;
}
