//! Incremental aggregation over tumbling windows
//!
//! - [`Accumulator`]: fold/merge/finalize contract for window state
//! - [`KpiAccumulator`]: the retail KPIs (sale volume, OPM, rate of return,
//!   average transaction size)
//! - [`WindowAggregator`]: keyed open-window state with watermark gating,
//!   finalization and snapshot/restore
//!
//! # Example
//!
//! ```rust
//! use processor::aggregation::{GroupBy, WindowAggregator};
//! use processor::watermark::Watermark;
//! use std::time::Duration;
//!
//! let mut agg = WindowAggregator::new("global_kpi", Duration::from_secs(60), GroupBy::None).unwrap();
//! assert!(agg.finalize_ready(Watermark::new(60_000)).unwrap().is_empty());
//! ```

// Re-name to avoid collision with trait
mod trait_;

pub mod aggregator;
pub mod kpi;

pub use aggregator::{
    AggregatorSnapshot, AggregatorStats, FinalizedWindow, GroupBy, IngestOutcome, IngestReport,
    WindowAggregator,
};
pub use kpi::{KpiAccumulator, KpiValues};
pub use trait_::Accumulator;
