//! Replayable, offset-addressable event sources
//!
//! The engine never commits offsets to a source. It reads from an explicit
//! [`SourcePosition`] and persists the position it reached in its own
//! checkpoint, so replaying a tick always reads the same range.

use crate::config::{SourceConfig, SourceKind, StartPosition};
use crate::error::{Result, SourceResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub mod file;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

pub use file::FileSource;
#[cfg(feature = "kafka")]
pub use kafka::KafkaSource;
pub use memory::MemorySource;

/// Next offset to read, per partition
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourcePosition {
    offsets: BTreeMap<u32, i64>,
}

impl SourcePosition {
    /// Empty position
    pub fn new() -> Self {
        Self::default()
    }

    /// Position from `(partition, next offset)` pairs
    pub fn from_offsets(offsets: impl IntoIterator<Item = (u32, i64)>) -> Self {
        Self {
            offsets: offsets.into_iter().collect(),
        }
    }

    /// Next offset for a partition
    pub fn get(&self, partition: u32) -> Option<i64> {
        self.offsets.get(&partition).copied()
    }

    /// Set the next offset for a partition
    pub fn set(&mut self, partition: u32, next_offset: i64) {
        self.offsets.insert(partition, next_offset);
    }

    /// Partitions and offsets in partition order
    pub fn iter(&self) -> impl Iterator<Item = (u32, i64)> + '_ {
        self.offsets.iter().map(|(p, o)| (*p, *o))
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.offsets.is_empty() {
            return f.write_str("{}");
        }
        let parts: Vec<String> = self
            .offsets
            .iter()
            .map(|(p, o)| format!("{}:{}", p, o))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// An undecoded record and where it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub payload: Vec<u8>,
    pub partition: u32,
    pub offset: i64,
}

impl RawEvent {
    pub fn new(partition: u32, offset: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            partition,
            offset,
        }
    }

    /// `partition@offset`, used in error messages
    pub fn position_label(&self) -> String {
        format!("{}@{}", self.partition, self.offset)
    }
}

/// Offsets that could not be read and were skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceGap {
    pub partition: u32,
    /// Offset the reader asked for
    pub expected: i64,
    /// Offset reading resumed at
    pub resumed_at: i64,
}

impl fmt::Display for SourceGap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "partition {}: expected offset {}, resumed at {}",
            self.partition, self.expected, self.resumed_at
        )
    }
}

/// Result of one read
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    /// Records in source order
    pub events: Vec<RawEvent>,
    /// Position after the last returned record
    pub next_position: SourcePosition,
    /// Ranges skipped because they were no longer available
    pub gaps: Vec<SourceGap>,
}

/// Replayable input stream
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Translate a configured start position into concrete offsets
    async fn resolve_start(&self, start: &StartPosition) -> SourceResult<SourcePosition>;

    /// Read up to `max_events` records starting at `position`
    ///
    /// Must return the same records for the same position as long as they
    /// are retained.
    async fn read_from(
        &self,
        position: &SourcePosition,
        max_events: Option<usize>,
    ) -> SourceResult<SourceBatch>;

    /// Earliest readable position at or after `position`
    async fn next_available(&self, position: &SourcePosition) -> SourceResult<SourcePosition>;
}

/// Build the configured source
pub fn from_config(config: &SourceConfig) -> Result<Arc<dyn EventSource>> {
    match &config.kind {
        SourceKind::File { path } => Ok(Arc::new(FileSource::new(path))),
        #[cfg(feature = "kafka")]
        SourceKind::Kafka {
            brokers,
            topic,
            group_id,
            properties,
        } => Ok(Arc::new(KafkaSource::new(brokers, topic, group_id, properties)?)),
        #[cfg(not(feature = "kafka"))]
        SourceKind::Kafka { .. } => Err(crate::error::ProcessorError::Configuration {
            source: "kafka source requested but the `kafka` feature is not enabled".into(),
        }),
    }
}

pub(crate) fn explicit_offsets(start: &StartPosition) -> Option<SourcePosition> {
    match start {
        StartPosition::Explicit { offsets } => Some(SourcePosition::from_offsets(
            offsets.iter().map(|o| (o.partition, o.offset)),
        )),
        _ => None,
    }
}

/// Offsets one read consumes, derived from per-partition bounds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadPlan {
    /// Half-open `[start, end)` offset range per partition with records to read
    pub ranges: BTreeMap<u32, (i64, i64)>,
    pub gaps: Vec<SourceGap>,
    /// Position once every range has been consumed
    pub next_position: SourcePosition,
}

impl ReadPlan {
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Plan a read from `position` given the retained `(low, high)` offsets of
/// each partition
///
/// Partitions are visited in order and share the `max_events` budget. A
/// partition whose low offset is above the requested one reports a gap and
/// resumes at the low offset.
pub fn plan_read(
    bounds: &BTreeMap<u32, (i64, i64)>,
    position: &SourcePosition,
    max_events: Option<usize>,
) -> ReadPlan {
    let mut plan = ReadPlan {
        next_position: position.clone(),
        ..Default::default()
    };
    let mut budget = max_events.map_or(i64::MAX, |max| i64::try_from(max).unwrap_or(i64::MAX));

    for (&partition, &(low, high)) in bounds {
        let mut next = position.get(partition).unwrap_or(low);
        if next < low {
            plan.gaps.push(SourceGap {
                partition,
                expected: next,
                resumed_at: low,
            });
            next = low;
        }

        let available = (high - next).max(0).min(budget);
        if available > 0 {
            budget -= available;
            plan.ranges.insert(partition, (next, next + available));
        }
        plan.next_position.set(partition, next + available);
    }
    plan
}
