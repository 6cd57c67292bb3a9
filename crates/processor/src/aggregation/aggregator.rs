//! Tumbling-window KPI aggregation over the enriched stream
//!
//! A [`WindowAggregator`] keeps one [`KpiAccumulator`] per open
//! [`WindowKey`]. Folding is gated by the watermark in force when the tick
//! started; finalization sweeps every key whose window end the watermark has
//! reached, emits it once and forgets it.

use super::kpi::{KpiAccumulator, KpiValues};
use super::trait_::Accumulator;
use crate::error::{AggregationResult, CheckpointError, CheckpointResult, WindowError};
use crate::watermark::Watermark;
use crate::window::{TumblingWindowAssigner, WindowBounds, WindowKey};
use retail_kpi_types::{CountryKpiRecord, EnrichedTransaction, GlobalKpiRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, trace};

/// Optional grouping key of an aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    /// One accumulator per window
    None,
    /// One accumulator per window and country
    Country,
}

impl GroupBy {
    fn key_for(&self, bounds: WindowBounds, txn: &EnrichedTransaction) -> WindowKey {
        match self {
            GroupBy::None => WindowKey::global(bounds),
            GroupBy::Country => WindowKey::grouped(bounds, txn.country()),
        }
    }
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupBy::None => f.write_str("none"),
            GroupBy::Country => f.write_str("country"),
        }
    }
}

/// What happened to one ingested event
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Folded into an open window; `late` if the event time was already
    /// behind the watermark
    Folded { late: bool },
    /// Window already closed, event discarded without touching state
    DroppedLate(WindowError),
}

/// Result of folding a batch of events
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    /// Events folded into open windows
    pub folded: u64,
    /// Folded events whose event time was behind the watermark
    pub late_folded: u64,
    /// Events dropped because their window was already closed
    pub dropped: Vec<WindowError>,
}

/// A window that the watermark has closed
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedWindow {
    pub key: WindowKey,
    pub kpis: KpiValues,
}

impl FinalizedWindow {
    /// Output row for an ungrouped aggregation
    pub fn to_global_record(&self) -> Option<GlobalKpiRecord> {
        Some(GlobalKpiRecord {
            window: self.key.bounds.to_span()?,
            opm: self.kpis.opm,
            total_sale_volume: self.kpis.total_sale_volume,
            average_transaction_size: self.kpis.average_transaction_size,
            rate_of_return: self.kpis.rate_of_return,
        })
    }

    /// Output row for a per-country aggregation
    pub fn to_country_record(&self) -> Option<CountryKpiRecord> {
        Some(CountryKpiRecord {
            window: self.key.bounds.to_span()?,
            country: self.key.group.clone()?,
            opm: self.kpis.opm,
            total_sale_volume: self.kpis.total_sale_volume,
            rate_of_return: self.kpis.rate_of_return,
        })
    }
}

/// Aggregator counters, carried with the aggregator state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorStats {
    pub events_folded: u64,
    pub late_folded: u64,
    pub dropped_late: u64,
    pub windows_finalized: u64,
}

/// Serializable state of a [`WindowAggregator`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorSnapshot {
    /// Aggregator name, also its checkpoint namespace
    pub name: String,
    /// Window size the state was built with
    pub window_size_ms: i64,
    /// Grouping the state was built with
    pub group_by: GroupBy,
    /// Open windows in key order
    pub windows: Vec<(WindowKey, KpiAccumulator)>,
    /// Counters at snapshot time
    pub stats: AggregatorStats,
}

/// Incremental tumbling-window aggregator
#[derive(Debug, Clone)]
pub struct WindowAggregator {
    name: String,
    group_by: GroupBy,
    assigner: TumblingWindowAssigner,
    open: BTreeMap<WindowKey, KpiAccumulator>,
    stats: AggregatorStats,
}

impl WindowAggregator {
    /// Create an empty aggregator
    pub fn new(
        name: impl Into<String>,
        window_size: Duration,
        group_by: GroupBy,
    ) -> Result<Self, WindowError> {
        Ok(Self {
            name: name.into(),
            group_by,
            assigner: TumblingWindowAssigner::new(window_size)?,
            open: BTreeMap::new(),
            stats: AggregatorStats::default(),
        })
    }

    /// Aggregator name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Grouping key of this aggregator
    pub fn group_by(&self) -> GroupBy {
        self.group_by
    }

    /// Fold one event, or drop it if its window is already closed
    pub fn ingest(&mut self, txn: &EnrichedTransaction, watermark: Watermark) -> IngestOutcome {
        let event_time = txn.event_time().timestamp_millis();
        let bounds = self.assigner.assign(event_time);

        if bounds.is_closed_by(watermark.timestamp) {
            self.stats.dropped_late += 1;
            trace!(
                aggregator = %self.name,
                event_time,
                window_end = bounds.end,
                "Dropping event for closed window"
            );
            return IngestOutcome::DroppedLate(WindowError::LateEvent {
                event_time,
                window_end: bounds.end,
                watermark: watermark.timestamp,
            });
        }

        let key = self.group_by.key_for(bounds, txn);
        self.open.entry(key).or_default().update(txn);
        self.stats.events_folded += 1;

        let late = watermark.covers(event_time);
        if late {
            self.stats.late_folded += 1;
        }
        IngestOutcome::Folded { late }
    }

    /// Fold a batch of events in order against one watermark
    pub fn ingest_batch(
        &mut self,
        events: &[EnrichedTransaction],
        watermark: Watermark,
    ) -> IngestReport {
        let mut report = IngestReport::default();
        for txn in events {
            match self.ingest(txn, watermark) {
                IngestOutcome::Folded { late } => {
                    report.folded += 1;
                    if late {
                        report.late_folded += 1;
                    }
                }
                IngestOutcome::DroppedLate(err) => report.dropped.push(err),
            }
        }
        report
    }

    /// Remove and emit every open window whose end is at or below the watermark
    ///
    /// Windows come out in key order. A key is never emitted twice because it
    /// leaves the open state here, and later events for it are dropped as late.
    pub fn finalize_ready(&mut self, watermark: Watermark) -> AggregationResult<Vec<FinalizedWindow>> {
        let closed: Vec<WindowKey> = self
            .open
            .keys()
            .take_while(|key| key.bounds.is_closed_by(watermark.timestamp))
            .cloned()
            .collect();

        let mut finalized = Vec::with_capacity(closed.len());
        for key in closed {
            if let Some(acc) = self.open.remove(&key) {
                let kpis = acc.finalize()?;
                finalized.push(FinalizedWindow { key, kpis });
            }
        }

        if !finalized.is_empty() {
            self.stats.windows_finalized += finalized.len() as u64;
            debug!(
                aggregator = %self.name,
                watermark = %watermark,
                count = finalized.len(),
                "Finalized windows"
            );
        }
        Ok(finalized)
    }

    /// Number of open windows
    pub fn open_windows(&self) -> usize {
        self.open.len()
    }

    /// Keys of open windows in order
    pub fn open_keys(&self) -> impl Iterator<Item = &WindowKey> {
        self.open.keys()
    }

    /// Aggregator counters
    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }

    /// Capture the state for checkpointing
    pub fn snapshot(&self) -> AggregatorSnapshot {
        AggregatorSnapshot {
            name: self.name.clone(),
            window_size_ms: self.assigner.size_ms(),
            group_by: self.group_by,
            windows: self
                .open
                .iter()
                .map(|(key, acc)| (key.clone(), acc.clone()))
                .collect(),
            stats: self.stats.clone(),
        }
    }

    /// Replace the state with a checkpointed snapshot
    ///
    /// The snapshot must come from an aggregator with the same window size and
    /// grouping.
    pub fn restore(&mut self, snapshot: AggregatorSnapshot) -> CheckpointResult<()> {
        if snapshot.window_size_ms != self.assigner.size_ms() {
            return Err(CheckpointError::Incompatible {
                namespace: self.name.clone(),
                reason: format!(
                    "window size {}ms, configured {}ms",
                    snapshot.window_size_ms,
                    self.assigner.size_ms()
                ),
            });
        }
        if snapshot.group_by != self.group_by {
            return Err(CheckpointError::Incompatible {
                namespace: self.name.clone(),
                reason: format!(
                    "grouping '{}', configured '{}'",
                    snapshot.group_by, self.group_by
                ),
            });
        }

        self.open = snapshot.windows.into_iter().collect();
        self.stats = snapshot.stats;
        debug!(
            aggregator = %self.name,
            open_windows = self.open.len(),
            "Restored aggregator state"
        );
        Ok(())
    }
}
