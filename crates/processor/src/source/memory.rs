//! In-process replayable log
//!
//! Cloned handles share one log, so a test can keep appending while the
//! engine reads. Retention truncation and injected read failures reproduce
//! the data-loss and transient-failure paths of a real broker.

use super::{explicit_offsets, plan_read, EventSource, RawEvent, SourceBatch, SourcePosition};
use crate::config::StartPosition;
use crate::error::{SourceError, SourceResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

#[derive(Debug, Default)]
struct PartitionLog {
    /// Offset of the first retained record
    base_offset: i64,
    records: VecDeque<Vec<u8>>,
}

impl PartitionLog {
    fn end_offset(&self) -> i64 {
        self.base_offset + self.records.len() as i64
    }
}

#[derive(Debug, Default)]
struct MemoryLog {
    partitions: BTreeMap<u32, PartitionLog>,
    failures_remaining: u32,
    reads: u64,
}

/// Shared in-memory event log
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    log: Arc<Mutex<MemoryLog>>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MemorySource {
    /// Create a log with `partitions` empty partitions
    pub fn new(partitions: u32) -> Self {
        let mut log = MemoryLog::default();
        for partition in 0..partitions.max(1) {
            log.partitions.insert(partition, PartitionLog::default());
        }
        Self {
            name: "memory".to_string(),
            log: Arc::new(Mutex::new(log)),
        }
    }

    /// Append a record, returning its offset
    pub fn append(&self, partition: u32, payload: impl Into<Vec<u8>>) -> i64 {
        let mut log = self.log.lock();
        let part = log.partitions.entry(partition).or_default();
        let offset = part.end_offset();
        part.records.push_back(payload.into());
        offset
    }

    /// Append a JSON value to partition 0
    pub fn append_json(&self, value: &serde_json::Value) -> i64 {
        self.append(0, value.to_string())
    }

    /// Drop every record of `partition` below `offset`
    pub fn truncate_before(&self, partition: u32, offset: i64) {
        let mut log = self.log.lock();
        if let Some(part) = log.partitions.get_mut(&partition) {
            while part.base_offset < offset && part.records.pop_front().is_some() {
                part.base_offset += 1;
            }
        }
    }

    /// Make the next `count` reads fail with a transient error
    pub fn fail_next_reads(&self, count: u32) {
        self.log.lock().failures_remaining = count;
    }

    /// Offset after the last record, per partition
    pub fn end_position(&self) -> SourcePosition {
        let log = self.log.lock();
        SourcePosition::from_offsets(log.partitions.iter().map(|(p, part)| (*p, part.end_offset())))
    }

    /// Number of `read_from` calls served or failed
    pub fn reads(&self) -> u64 {
        self.log.lock().reads
    }
}

#[async_trait]
impl EventSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve_start(&self, start: &StartPosition) -> SourceResult<SourcePosition> {
        if let Some(position) = explicit_offsets(start) {
            return Ok(position);
        }
        let log = self.log.lock();
        Ok(SourcePosition::from_offsets(log.partitions.iter().map(
            |(p, part)| match start {
                StartPosition::Latest => (*p, part.end_offset()),
                _ => (*p, part.base_offset),
            },
        )))
    }

    async fn read_from(
        &self,
        position: &SourcePosition,
        max_events: Option<usize>,
    ) -> SourceResult<SourceBatch> {
        let mut log = self.log.lock();
        log.reads += 1;
        if log.failures_remaining > 0 {
            log.failures_remaining -= 1;
            return Err(SourceError::Transient {
                message: "injected read failure".to_string(),
            });
        }

        let bounds: BTreeMap<u32, (i64, i64)> = log
            .partitions
            .iter()
            .map(|(p, part)| (*p, (part.base_offset, part.end_offset())))
            .collect();
        let plan = plan_read(&bounds, position, max_events);

        let mut batch = SourceBatch {
            next_position: plan.next_position,
            gaps: plan.gaps,
            ..Default::default()
        };
        for (partition, (start, end)) in plan.ranges {
            let Some(part) = log.partitions.get(&partition) else {
                continue;
            };
            let skip = (start - part.base_offset) as usize;
            let records = part.records.iter().skip(skip).take((end - start) as usize);
            for (offset, payload) in (start..).zip(records) {
                batch.events.push(RawEvent::new(partition, offset, payload.clone()));
            }
        }

        Ok(batch)
    }

    async fn next_available(&self, position: &SourcePosition) -> SourceResult<SourcePosition> {
        let log = self.log.lock();
        let mut next = position.clone();
        for (partition, part) in &log.partitions {
            let offset = position.get(*partition).unwrap_or(part.base_offset);
            next.set(*partition, offset.max(part.base_offset));
        }
        Ok(next)
    }
}
