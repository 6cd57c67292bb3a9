//! Windowing for event-time aggregations
//!
//! Only tumbling windows are supported: fixed-size, non-overlapping, aligned
//! to the epoch. Each event belongs to exactly one window.
//!
//! ```text
//! Time:     0----5----10---15---20---25---30
//! Windows:  [----][----][----][----][----]
//! ```
//!
//! A window closes once the watermark reaches its end.

pub mod assigner;
pub mod types;

pub use assigner::TumblingWindowAssigner;
pub use types::{WindowBounds, WindowKey};
