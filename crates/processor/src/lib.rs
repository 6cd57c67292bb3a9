//! Micro-batch streaming engine for retail transaction KPIs
//!
//! This crate reads retail transactions from a replayable source, enriches
//! them, and maintains tumbling-window KPIs globally and per country. Output
//! is exactly-once: every tick delivers to idempotent sinks keyed by trigger
//! id and then commits one atomic checkpoint.

pub mod aggregation;
pub mod config;
pub mod decode;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod state;
pub mod watermark;
pub mod window;

// Re-export commonly used types
pub use aggregation::{GroupBy, KpiAccumulator, KpiValues, WindowAggregator};

pub use config::ProcessorConfig;

pub use error::{
    AggregationError, CheckpointError, DecodeError, ProcessorError, Result as ProcessorResult,
    SinkError, SourceError, WindowError,
};

pub use pipeline::{StreamEngine, TickOutcome, TriggerScheduler};

pub use sink::{DeliveryGuarantee, Sink, SinkBatch, SinkRouter};

pub use source::{EventSource, FileSource, MemorySource, SourcePosition};

pub use state::{Checkpoint, CheckpointCoordinator};

pub use watermark::{Watermark, WatermarkTracker};

pub use window::{TumblingWindowAssigner, WindowBounds, WindowKey};
