//! Tumbling window assignment

use super::types::WindowBounds;
use crate::error::WindowError;
use std::time::Duration;

/// Tumbling window assigner
///
/// Creates fixed-size, non-overlapping, epoch-aligned windows. Each event is
/// assigned to exactly one window based on its timestamp.
///
/// # Example
/// ```text
/// Window size: 5 seconds
/// Event at timestamp 7 -> Window [5, 10)
/// Event at timestamp 12 -> Window [10, 15)
/// Event at timestamp -3 -> Window [-5, 0)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TumblingWindowAssigner {
    /// Size of each window in milliseconds
    size_ms: i64,
}

impl TumblingWindowAssigner {
    /// Create a new tumbling window assigner
    pub fn new(size: Duration) -> Result<Self, WindowError> {
        let millis = size.as_millis();
        if millis == 0 || millis > i64::MAX as u128 {
            return Err(WindowError::InvalidWindowSize {
                size: u64::try_from(millis).unwrap_or(u64::MAX),
            });
        }
        Ok(Self {
            size_ms: millis as i64,
        })
    }

    /// Window size in milliseconds
    pub fn size_ms(&self) -> i64 {
        self.size_ms
    }

    /// Start of the window containing `timestamp`
    ///
    /// Uses floor division so timestamps before the epoch land in the window
    /// below them rather than being rounded towards zero.
    pub fn window_start(&self, timestamp: i64) -> i64 {
        timestamp.div_euclid(self.size_ms) * self.size_ms
    }

    /// Assign a timestamp to its window
    pub fn assign(&self, timestamp: i64) -> WindowBounds {
        let start = self.window_start(timestamp);
        WindowBounds::new(start, start.saturating_add(self.size_ms))
    }
}
