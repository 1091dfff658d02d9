//! Metric values read from files, one per service.
//!
//! `<dir>/<service>.metric` holds a single number, rewritten by whatever
//! measures the service. A missing or unparsable file is an unavailable
//! metric, which leaves the desired count alone.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::trace;

use shoal_autoscale::{MetricSource, MetricUnavailable};

pub struct FileMetrics {
    dir: PathBuf,
}

impl FileMetrics {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, service_id: &str) -> PathBuf {
        self.dir.join(format!("{service_id}.metric"))
    }
}

#[async_trait]
impl MetricSource for FileMetrics {
    async fn sample(&self, service_id: &str) -> Result<f64, MetricUnavailable> {
        let path = self.path(service_id);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| MetricUnavailable(format!("{}: {e}", path.display())))?;
        let value = raw
            .trim()
            .parse::<f64>()
            .map_err(|e| MetricUnavailable(format!("{}: {e}", path.display())))?;
        trace!(service = %service_id, value, "metric sampled");
        Ok(value)
    }
}
