//! Metrics registry shared by the engine components
//!
//! Wraps a prometheus-client [`Registry`] behind a lock so components can
//! register their metric families after construction and the CLI can encode
//! the text exposition at any time.

use parking_lot::RwLock;
use prometheus_client::registry::{Metric, Registry};
use std::path::Path;
use std::sync::Arc;

use super::MetricsError;

/// Prefix of every metric name
pub const METRICS_PREFIX: &str = "retail_kpi";

/// Thread-safe registry for Prometheus metrics
#[derive(Debug)]
pub struct MetricsRegistry {
    registry: Arc<RwLock<Registry>>,
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::with_prefix(METRICS_PREFIX))),
        }
    }

    /// Get a reference to the internal registry
    pub fn registry(&self) -> Arc<RwLock<Registry>> {
        self.registry.clone()
    }

    /// Register a metric under `name`
    pub fn register(&self, name: &str, help: &str, metric: impl Metric) {
        self.registry.write().register(name, help, metric);
    }

    /// Encode metrics in Prometheus text format
    pub fn encode(&self) -> Result<String, MetricsError> {
        let registry = self.registry.read();
        let mut buffer = String::new();

        prometheus_client::encoding::text::encode(&mut buffer, &registry)
            .map_err(|e| MetricsError::EncodingError(e.to_string()))?;

        Ok(buffer)
    }

    /// Write the text exposition to `path`, replacing it
    pub fn write_to_file(&self, path: &Path) -> Result<(), MetricsError> {
        let text = self.encode()?;
        std::fs::write(path, text).map_err(|source| MetricsError::Write {
            path: path.display().to_string(),
            source,
        })
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MetricsRegistry {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}
