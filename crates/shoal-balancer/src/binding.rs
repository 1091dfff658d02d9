//! Load balancer registration contract.

use async_trait::async_trait;
use thiserror::Error;

use shoal_state::Endpoint;

/// Errors reported by a load balancer binding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    #[error("load balancer unavailable: {0}")]
    Unavailable(String),

    #[error("endpoint {0} rejected: {1}")]
    Rejected(Endpoint, String),
}

/// Registers and deregisters task endpoints as traffic targets.
///
/// Both operations must be idempotent: registering a registered endpoint
/// or deregistering an unknown one succeeds without effect.
#[async_trait]
pub trait TargetBinding: Send + Sync {
    async fn register(&self, endpoint: &Endpoint) -> Result<(), BindingError>;

    async fn deregister(&self, endpoint: &Endpoint) -> Result<(), BindingError>;
}
