//! Prometheus metrics for the engine
//!
//! All metric families follow Prometheus naming conventions and are prefixed
//! with `retail_kpi_`. The text exposition can be written to a file on
//! shutdown.

mod engine;
mod registry;

pub use engine::{AggregatorLabels, DecodeErrorLabels, EngineMetrics, SinkLabels, TickLabels};
pub use registry::{MetricsRegistry, METRICS_PREFIX};

use thiserror::Error;

/// Errors that can occur in the metrics subsystem
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Metric encoding error: {0}")]
    EncodingError(String),

    #[error("Failed to write metrics to {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, MetricsError>;
