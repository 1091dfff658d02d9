//! Target group: an in-memory load balancer binding.
//!
//! Holds the registered endpoints of one service and hands them out
//! round-robin. Used by the daemon when no external balancer is wired in,
//! and by tests that need to observe registration order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::debug;

use shoal_state::{Endpoint, epoch_millis};

use crate::binding::{BindingError, TargetBinding};

/// A registered traffic target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub endpoint: Endpoint,
    /// Epoch millis at which the endpoint was registered.
    pub registered_at: u64,
}

#[derive(Debug, Default)]
struct Inner {
    targets: Vec<Target>,
    counter: AtomicUsize,
}

/// Registered endpoints of one service with round-robin selection.
///
/// Cheap to clone; clones share the same target list.
#[derive(Debug, Clone)]
pub struct TargetGroup {
    name: String,
    inner: Arc<RwLock<Inner>>,
}

impl TargetGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add an endpoint. Returns `false` if it was already registered.
    pub fn add(&self, endpoint: &Endpoint, now: u64) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.targets.iter().any(|t| &t.endpoint == endpoint) {
            return false;
        }
        inner.targets.push(Target {
            endpoint: endpoint.clone(),
            registered_at: now,
        });
        debug!(group = %self.name, %endpoint, count = inner.targets.len(), "target added");
        true
    }

    /// Remove an endpoint. Returns `false` if it was not registered.
    pub fn remove(&self, endpoint: &Endpoint) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = inner.targets.len();
        inner.targets.retain(|t| &t.endpoint != endpoint);
        let removed = inner.targets.len() != before;
        if removed {
            debug!(group = %self.name, %endpoint, count = inner.targets.len(), "target removed");
        }
        removed
    }

    /// Select the next target (round-robin).
    pub fn next_target(&self) -> Option<Endpoint> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        if inner.targets.is_empty() {
            return None;
        }
        let idx = inner.counter.fetch_add(1, Ordering::Relaxed) % inner.targets.len();
        Some(inner.targets[idx].endpoint.clone())
    }

    /// All registered targets in registration order.
    pub fn targets(&self) -> Vec<Target> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .targets
            .clone()
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .targets
            .iter()
            .any(|t| &t.endpoint == endpoint)
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .targets
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TargetBinding for TargetGroup {
    async fn register(&self, endpoint: &Endpoint) -> Result<(), BindingError> {
        self.add(endpoint, epoch_millis());
        Ok(())
    }

    async fn deregister(&self, endpoint: &Endpoint) -> Result<(), BindingError> {
        self.remove(endpoint);
        Ok(())
    }
}
