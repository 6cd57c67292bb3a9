//! Event-time watermark tracking
//!
//! A watermark is a timestamp threshold asserting that no more events at or
//! below it are expected. The tracker follows the bounded out-of-orderness
//! rule: `watermark = max(event_time seen) - allowed_lateness`, and it never
//! moves backwards.
//!
//! # Example
//!
//! ```rust
//! use processor::watermark::WatermarkTracker;
//! use std::time::Duration;
//!
//! let mut tracker = WatermarkTracker::new(Duration::from_secs(60));
//! tracker.observe(120_000);
//! assert_eq!(tracker.current().timestamp, 60_000);
//! assert!(tracker.is_late(60_000));
//! assert!(!tracker.is_late(60_001));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;

/// Represents a watermark timestamp
///
/// Watermarks indicate that all events with timestamps less than or equal to the watermark
/// have been seen. Closing windows and dropping late events are both decided against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark {
    /// The watermark timestamp in milliseconds since epoch
    pub timestamp: i64,
}

impl Watermark {
    /// Creates a new watermark with the given timestamp
    pub fn new(timestamp: i64) -> Self {
        Self { timestamp }
    }

    /// Creates a watermark from a DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self {
            timestamp: dt.timestamp_millis(),
        }
    }

    /// Converts the watermark to a DateTime, `None` outside chrono's range
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }

    /// Returns the minimum possible watermark (beginning of time)
    pub fn min() -> Self {
        Self { timestamp: i64::MIN }
    }

    /// Returns true if this is the minimum watermark
    pub fn is_min(&self) -> bool {
        self.timestamp == i64::MIN
    }

    /// Whether an instant at `timestamp` is covered by this watermark
    pub fn covers(&self, timestamp: i64) -> bool {
        timestamp <= self.timestamp
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::min()
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_min() {
            return f.write_str("Watermark(min)");
        }
        match self.to_datetime() {
            Some(dt) => write!(f, "Watermark({})", dt.to_rfc3339()),
            None => write!(f, "Watermark({}ms)", self.timestamp),
        }
    }
}

/// Persisted form of a [`WatermarkTracker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkState {
    /// Largest event time observed so far, if any
    pub max_event_time: Option<i64>,
    /// Watermark derived from `max_event_time`
    pub watermark: Watermark,
}

impl Default for WatermarkState {
    fn default() -> Self {
        Self {
            max_event_time: None,
            watermark: Watermark::min(),
        }
    }
}

/// Bounded out-of-orderness watermark tracker for one logical stream
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    /// Maximum tolerated delay between event time and watermark
    allowed_lateness_ms: i64,
    /// Largest event time observed
    max_event_time: Option<i64>,
    /// Current watermark
    current: Watermark,
    /// Number of events observed since construction
    observed: u64,
}

impl WatermarkTracker {
    /// Creates a tracker at the minimum watermark
    pub fn new(allowed_lateness: Duration) -> Self {
        Self::from_state(allowed_lateness, WatermarkState::default())
    }

    /// Recreates a tracker from a checkpointed state
    pub fn from_state(allowed_lateness: Duration, state: WatermarkState) -> Self {
        let allowed_lateness_ms = i64::try_from(allowed_lateness.as_millis()).unwrap_or(i64::MAX);
        Self {
            allowed_lateness_ms,
            max_event_time: state.max_event_time,
            current: state.watermark,
            observed: 0,
        }
    }

    /// Observe an event time, advancing the watermark if it grew
    ///
    /// Returns the new watermark when it advanced.
    pub fn observe(&mut self, event_time: i64) -> Option<Watermark> {
        self.observed += 1;
        let max_ts = match self.max_event_time {
            Some(max_ts) if max_ts >= event_time => return None,
            _ => event_time,
        };
        self.max_event_time = Some(max_ts);

        let candidate = Watermark::new(max_ts.saturating_sub(self.allowed_lateness_ms));
        if candidate > self.current {
            self.current = candidate;
            trace!(watermark = %candidate, "Advanced watermark");
            Some(candidate)
        } else {
            None
        }
    }

    /// Current watermark
    pub fn current(&self) -> Watermark {
        self.current
    }

    /// Whether an event at `event_time` is already behind the watermark
    pub fn is_late(&self, event_time: i64) -> bool {
        self.current.covers(event_time)
    }

    /// How far behind the watermark an event is, 0 if it is not late
    pub fn lateness(&self, event_time: i64) -> i64 {
        if self.is_late(event_time) {
            self.current.timestamp.saturating_sub(event_time)
        } else {
            0
        }
    }

    /// Largest event time observed
    pub fn max_event_time(&self) -> Option<i64> {
        self.max_event_time
    }

    /// Number of events observed by this instance
    pub fn observed(&self) -> u64 {
        self.observed
    }

    /// Snapshot for checkpointing
    pub fn state(&self) -> WatermarkState {
        WatermarkState {
            max_event_time: self.max_event_time,
            watermark: self.current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_ordering() {
        let wm1 = Watermark::new(1000);
        let wm2 = Watermark::new(2000);
        assert!(wm1 < wm2);
        assert!(Watermark::min() < wm1);
        assert!(Watermark::default().is_min());
    }

    #[test]
    fn test_tracker_basic() {
        let mut tracker = WatermarkTracker::new(Duration::from_secs(5));

        tracker.observe(10_000);
        tracker.observe(15_000);
        tracker.observe(20_000);

        // 20000 - 5000
        assert_eq!(tracker.current().timestamp, 15_000);
        assert_eq!(tracker.max_event_time(), Some(20_000));
        assert_eq!(tracker.observed(), 3);
    }

    #[test]
    fn test_tracker_out_of_order() {
        let mut tracker = WatermarkTracker::new(Duration::from_secs(10));

        assert!(tracker.observe(30_000).is_some());
        assert!(tracker.observe(20_000).is_none());
        assert!(tracker.observe(25_000).is_none());

        assert_eq!(tracker.current().timestamp, 20_000);
    }

    #[test]
    fn test_is_late_is_inclusive() {
        let mut tracker = WatermarkTracker::new(Duration::from_secs(60));
        assert!(!tracker.is_late(i64::MIN + 1));

        tracker.observe(180_000);
        assert!(tracker.is_late(120_000));
        assert!(!tracker.is_late(120_001));
        assert_eq!(tracker.lateness(100_000), 20_000);
        assert_eq!(tracker.lateness(130_000), 0);
    }

    #[test]
    fn test_zero_lateness() {
        let mut tracker = WatermarkTracker::new(Duration::ZERO);
        tracker.observe(5_000);
        assert_eq!(tracker.current(), Watermark::new(5_000));
    }

    #[test]
    fn test_state_roundtrip_keeps_watermark() {
        let mut tracker = WatermarkTracker::new(Duration::from_secs(60));
        tracker.observe(200_000);
        let state = tracker.state();

        let mut restored = WatermarkTracker::from_state(Duration::from_secs(60), state);
        assert_eq!(restored.current(), tracker.current());

        // An older event after restore must not move the watermark back
        assert!(restored.observe(150_000).is_none());
        assert_eq!(restored.current().timestamp, 140_000);
    }

    #[test]
    fn test_watermark_monotonicity() {
        let mut tracker = WatermarkTracker::new(Duration::from_millis(100));
        let mut last = tracker.current();
        for ts in [500, 300, 900, 100, 900, 2_000, 1_500] {
            tracker.observe(ts);
            assert!(tracker.current() >= last);
            last = tracker.current();
        }
        assert_eq!(last.timestamp, 1_900);
    }

    #[test]
    fn test_display() {
        assert_eq!(Watermark::min().to_string(), "Watermark(min)");
        assert_eq!(
            Watermark::new(0).to_string(),
            "Watermark(1970-01-01T00:00:00+00:00)"
        );
    }
}
