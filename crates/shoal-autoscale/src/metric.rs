//! Metric sources feeding the autoscaler.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;

/// The metric for a service could not be read this cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("metric unavailable: {0}")]
pub struct MetricUnavailable(pub String);

/// Supplies the current load metric of a service.
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn sample(&self, service_id: &str) -> Result<f64, MetricUnavailable>;
}

/// Metric values set by hand, keyed by service id.
///
/// Cheap to clone; clones share the same values.
#[derive(Debug, Clone, Default)]
pub struct ManualMetrics {
    values: Arc<RwLock<HashMap<String, f64>>>,
}

impl ManualMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, service_id: &str, value: f64) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service_id.to_string(), value);
    }

    pub fn clear(&self, service_id: &str) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(service_id);
    }
}

#[async_trait]
impl MetricSource for ManualMetrics {
    async fn sample(&self, service_id: &str) -> Result<f64, MetricUnavailable> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service_id)
            .copied()
            .ok_or_else(|| MetricUnavailable(format!("no value for {service_id}")))
    }
}
