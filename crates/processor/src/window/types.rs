//! Window types and bounds
//!
//! Bounds are kept in epoch milliseconds so keys order and hash cheaply and
//! encode compactly in checkpoints.

use chrono::{DateTime, Utc};
use retail_kpi_types::WindowSpan;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Time bounds of a window, `[start, end)` in epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowBounds {
    /// Start time of the window (inclusive)
    pub start: i64,
    /// End time of the window (exclusive)
    pub end: i64,
}

impl WindowBounds {
    /// Create new window bounds
    pub fn new(start: i64, end: i64) -> Self {
        debug_assert!(start < end, "Window start must be before end");
        Self { start, end }
    }

    /// Window length in milliseconds
    pub fn size_ms(&self) -> i64 {
        self.end - self.start
    }

    /// Check if a timestamp falls within this window
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Whether the watermark has passed the end of this window
    pub fn is_closed_by(&self, watermark: i64) -> bool {
        self.end <= watermark
    }

    /// Convert to the output representation, `None` outside chrono's range
    pub fn to_span(&self) -> Option<WindowSpan> {
        Some(WindowSpan {
            start: DateTime::<Utc>::from_timestamp_millis(self.start)?,
            end: DateTime::<Utc>::from_timestamp_millis(self.end)?,
        })
    }
}

impl fmt::Display for WindowBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_span() {
            Some(span) => write!(
                f,
                "[{} - {})",
                span.start.format("%Y-%m-%d %H:%M:%S%.3f"),
                span.end.format("%Y-%m-%d %H:%M:%S%.3f")
            ),
            None => write!(f, "[{}ms - {}ms)", self.start, self.end),
        }
    }
}

/// Key of one open accumulator: a window plus an optional group
///
/// Ordering is by window start, then end, then group, which fixes the
/// emission order of finalized windows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
    /// The time bounds of this window
    pub bounds: WindowBounds,
    /// Group key, `None` for ungrouped aggregations
    pub group: Option<String>,
}

impl WindowKey {
    /// Key for an ungrouped window
    pub fn global(bounds: WindowBounds) -> Self {
        Self {
            bounds,
            group: None,
        }
    }

    /// Key for a grouped window
    pub fn grouped(bounds: WindowBounds, group: impl Into<String>) -> Self {
        Self {
            bounds,
            group: Some(group.into()),
        }
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.group {
            Some(group) => write!(f, "{}@{}", group, self.bounds),
            None => write!(f, "{}", self.bounds),
        }
    }
}
