//! The micro-batch tick
//!
//! One tick reads everything after the committed position, decodes it,
//! advances the watermark, folds both aggregators, finalizes closed windows,
//! delivers all output and commits a checkpoint. The tick works on a clone of
//! [`EngineState`]; the clone becomes the live state only once the checkpoint
//! is committed, so an aborted tick leaves nothing behind and its retry
//! reprocesses exactly the same input under the same trigger id.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use retail_kpi_types::{EnrichedRecord, EnrichedTransaction};
use tokio::time::sleep;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::aggregation::{GroupBy, WindowAggregator};
use crate::config::ProcessorConfig;
use crate::decode::decode_batch;
use crate::error::{CheckpointError, ProcessorError, Result, SourceError};
use crate::metrics::EngineMetrics;
use crate::sink::{ConsoleSink, FileSink, OutputRecord, SinkRouter};
use crate::source::{EventSource, SourceBatch, SourcePosition};
use crate::state::{Checkpoint, CheckpointCoordinator};
use crate::watermark::{Watermark, WatermarkTracker};

/// Destination and namespace of the global aggregator
pub const GLOBAL_KPI: &str = "global_kpi";

/// Destination and namespace of the per-country aggregator
pub const COUNTRY_KPI: &str = "country_kpi";

/// Destination of the raw enriched stream
pub const CONSOLE: &str = "console";

/// Everything a tick reads and writes
#[derive(Debug, Clone)]
pub struct EngineState {
    /// Next offsets to read
    pub position: SourcePosition,
    pub watermark: WatermarkTracker,
    pub global: WindowAggregator,
    pub country: WindowAggregator,
    /// Zero before the first commit
    pub last_committed_trigger_id: u64,
}

impl EngineState {
    fn aggregators(config: &ProcessorConfig) -> Result<(WindowAggregator, WindowAggregator)> {
        let size = config.window.size();
        let build = |name: &str, group_by| {
            WindowAggregator::new(name, size, group_by)
                .map_err(|e| ProcessorError::Configuration { source: Box::new(e) })
        };
        Ok((build(GLOBAL_KPI, GroupBy::None)?, build(COUNTRY_KPI, GroupBy::Country)?))
    }

    /// Empty state starting at `position`
    pub fn fresh(config: &ProcessorConfig, position: SourcePosition) -> Result<Self> {
        let (global, country) = Self::aggregators(config)?;
        Ok(Self {
            position,
            watermark: WatermarkTracker::new(config.window.allowed_lateness()),
            global,
            country,
            last_committed_trigger_id: 0,
        })
    }

    /// State recorded by a committed checkpoint
    pub fn from_checkpoint(config: &ProcessorConfig, mut checkpoint: Checkpoint) -> Result<Self> {
        let (mut global, mut country) = Self::aggregators(config)?;
        for aggregator in [&mut global, &mut country] {
            let snapshot = checkpoint
                .aggregators
                .remove(aggregator.name())
                .ok_or_else(|| CheckpointError::Incompatible {
                    namespace: aggregator.name().to_string(),
                    reason: "namespace missing from checkpoint".to_string(),
                })?;
            aggregator.restore(snapshot)?;
        }
        Ok(Self {
            position: checkpoint.source_position,
            watermark: WatermarkTracker::from_state(
                config.window.allowed_lateness(),
                checkpoint.watermark,
            ),
            global,
            country,
            last_committed_trigger_id: checkpoint.trigger_id,
        })
    }

    /// Checkpoint of this state under `trigger_id`
    pub fn to_checkpoint(&self, trigger_id: u64) -> Checkpoint {
        Checkpoint {
            trigger_id,
            created_at: Utc::now(),
            source_position: self.position.clone(),
            watermark: self.watermark.state(),
            aggregators: [
                (GLOBAL_KPI.to_string(), self.global.snapshot()),
                (COUNTRY_KPI.to_string(), self.country.snapshot()),
            ]
            .into_iter()
            .collect(),
        }
    }
}

/// Counters of one committed tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickStats {
    pub trigger_id: u64,
    pub records_read: u64,
    pub records_decoded: u64,
    pub decode_errors: u64,
    /// Late events seen by the global aggregator
    pub global_late: LateCounts,
    /// Late events seen by the per-country aggregator; every event reaches
    /// both aggregators, so one late event counts once on each side
    pub country_late: LateCounts,
    pub global_windows: u64,
    pub country_windows: u64,
    pub gaps: u64,
    /// Watermark in force when the tick started
    pub watermark_before: Watermark,
    /// Watermark used for the finalization sweep
    pub watermark_after: Watermark,
}

/// Late event counts of one aggregator within a tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LateCounts {
    /// Folded into a window that was still open
    pub folded: u64,
    /// Dropped because their window had closed
    pub dropped: u64,
}

/// How a tick ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Output delivered and checkpoint committed
    Committed(TickStats),
    /// No new input and no position change; nothing committed
    NoOp,
    /// A recoverable failure; the live state is unchanged and the trigger id
    /// will be reused
    Aborted { trigger_id: u64, reason: String },
}

impl TickOutcome {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            TickOutcome::Committed(_) => "committed",
            TickOutcome::NoOp => "noop",
            TickOutcome::Aborted { .. } => "aborted",
        }
    }
}

/// Build the checkpoint coordinator for `config`
pub fn checkpoint_coordinator(config: &ProcessorConfig) -> CheckpointCoordinator {
    CheckpointCoordinator::new(&config.checkpoint.path, config.checkpoint.max_retained)
        .with_namespace(GLOBAL_KPI, &config.sinks.global_kpi.checkpoint_path)
        .with_namespace(COUNTRY_KPI, &config.sinks.country_kpi.checkpoint_path)
}

/// Build the configured sinks
pub fn sink_router(config: &ProcessorConfig, metrics: EngineMetrics) -> SinkRouter {
    let mut router = SinkRouter::new(
        config.sinks.max_attempts,
        config.sinks.retry_backoff(),
        config.parallelism,
    )
    .with_metrics(metrics)
    .with_sink(Arc::new(FileSink::new(GLOBAL_KPI, &config.sinks.global_kpi.path)))
    .with_sink(Arc::new(FileSink::new(COUNTRY_KPI, &config.sinks.country_kpi.path)));
    if config.sinks.console.enabled {
        router.register(Arc::new(ConsoleSink::stdout(config.sinks.console.truncate)));
    }
    router
}

/// Micro-batch streaming engine
pub struct StreamEngine {
    config: ProcessorConfig,
    source: Arc<dyn EventSource>,
    router: SinkRouter,
    checkpoints: CheckpointCoordinator,
    metrics: EngineMetrics,
    state: EngineState,
}

impl StreamEngine {
    /// Restore the last checkpoint, or start at the configured position
    ///
    /// Both KPI destinations must be registered on `router`.
    pub async fn open(
        config: ProcessorConfig,
        source: Arc<dyn EventSource>,
        router: SinkRouter,
        metrics: EngineMetrics,
    ) -> Result<Self> {
        for destination in [GLOBAL_KPI, COUNTRY_KPI] {
            if !router.has(destination) {
                return Err(ProcessorError::Configuration {
                    source: format!("no sink registered for '{}'", destination).into(),
                });
            }
        }

        let checkpoints = checkpoint_coordinator(&config);
        let state = match checkpoints.restore().await? {
            Some(checkpoint) => EngineState::from_checkpoint(&config, checkpoint)?,
            None => {
                let position = source.resolve_start(&config.source.start_position).await?;
                info!(source = source.name(), %position, "Starting from configured position");
                EngineState::fresh(&config, position)?
            }
        };

        metrics.set_watermark(state.watermark.current());
        metrics.record_finalized(GLOBAL_KPI, 0, state.global.open_windows());
        metrics.record_finalized(COUNTRY_KPI, 0, state.country.open_windows());

        info!(
            source = source.name(),
            trigger_id = state.last_committed_trigger_id,
            position = %state.position,
            watermark = %state.watermark.current(),
            "Engine opened"
        );
        Ok(Self {
            config,
            source,
            router,
            checkpoints,
            metrics,
            state,
        })
    }

    /// Open with the configured source and sinks
    pub async fn from_config(config: ProcessorConfig, metrics: EngineMetrics) -> Result<Self> {
        let source = crate::source::from_config(&config.source)?;
        let router = sink_router(&config, metrics.clone());
        Self::open(config, source, router, metrics).await
    }

    /// Live state, as of the last commit
    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn checkpoints(&self) -> &CheckpointCoordinator {
        &self.checkpoints
    }

    /// Trigger id the next tick will use
    pub fn next_trigger_id(&self) -> u64 {
        self.state.last_committed_trigger_id + 1
    }

    /// Run one tick
    ///
    /// Recoverable failures come back as [`TickOutcome::Aborted`]; only
    /// fatal errors are returned as `Err`.
    pub async fn run_tick(&mut self) -> Result<TickOutcome> {
        let trigger_id = self.next_trigger_id();
        let span = info_span!("tick", trigger_id);
        let started = Instant::now();

        let outcome = match self.execute_tick(trigger_id).instrument(span.clone()).await {
            Ok(outcome) => outcome,
            Err(err) if !err.is_fatal() => {
                span.in_scope(|| warn!(error = %err, "Tick aborted, will retry"));
                TickOutcome::Aborted {
                    trigger_id,
                    reason: err.to_string(),
                }
            }
            Err(err) => {
                span.in_scope(|| tracing::error!(error = %err, "Tick failed with a fatal error"));
                self.metrics.record_tick("failed");
                return Err(err);
            }
        };

        self.metrics.record_tick(outcome.label());
        if let TickOutcome::Committed(stats) = &outcome {
            span.in_scope(|| {
                info!(
                    records = stats.records_read,
                    decoded = stats.records_decoded,
                    decode_errors = stats.decode_errors,
                    global_late_dropped = stats.global_late.dropped,
                    country_late_dropped = stats.country_late.dropped,
                    global_windows = stats.global_windows,
                    country_windows = stats.country_windows,
                    watermark = %stats.watermark_after,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Tick committed"
                )
            });
        }
        Ok(outcome)
    }

    async fn execute_tick(&mut self, trigger_id: u64) -> Result<TickOutcome> {
        let batch = self.read_with_retry(&self.state.position).await?;

        if let Some(gap) = batch.gaps.first() {
            if self.config.source.fail_on_data_loss {
                return Err(SourceError::DataLoss {
                    partition: gap.partition,
                    expected: gap.expected,
                    available: gap.resumed_at,
                }
                .into());
            }
            for gap in &batch.gaps {
                warn!(%gap, "Skipping records that are no longer available");
            }
        }

        if batch.events.is_empty() && batch.next_position == self.state.position {
            debug!("No new input");
            return Ok(TickOutcome::NoOp);
        }

        let mut next = self.state.clone();
        let mut stats = TickStats {
            trigger_id,
            records_read: batch.events.len() as u64,
            gaps: batch.gaps.len() as u64,
            ..Default::default()
        };

        let mut decode_failures = Vec::new();
        let mut transactions: Vec<EnrichedTransaction> = Vec::with_capacity(batch.events.len());
        for result in decode_batch(Arc::new(batch.events), self.config.parallelism).await? {
            match result {
                Ok(txn) => transactions.push(txn),
                Err(err) => {
                    warn!(error = %err, "Dropping undecodable record");
                    decode_failures.push(err.kind());
                }
            }
        }
        stats.records_decoded = transactions.len() as u64;
        stats.decode_errors = decode_failures.len() as u64;

        // Late drops are decided against the watermark in force at tick start
        let watermark_before = next.watermark.current();
        for txn in &transactions {
            next.watermark.observe(txn.event_time().timestamp_millis());
        }

        for (aggregator, late) in [
            (&mut next.global, &mut stats.global_late),
            (&mut next.country, &mut stats.country_late),
        ] {
            let report = aggregator.ingest_batch(&transactions, watermark_before);
            for dropped in &report.dropped {
                debug!(aggregator = aggregator.name(), error = %dropped, "Dropped late event");
            }
            *late = LateCounts {
                folded: report.late_folded,
                dropped: report.dropped.len() as u64,
            };
        }

        let watermark_after = next.watermark.current();
        let global_rows: Vec<OutputRecord> = next
            .global
            .finalize_ready(watermark_after)?
            .iter()
            .filter_map(|w| w.to_global_record())
            .map(OutputRecord::from)
            .collect();
        let country_rows: Vec<OutputRecord> = next
            .country
            .finalize_ready(watermark_after)?
            .iter()
            .filter_map(|w| w.to_country_record())
            .map(OutputRecord::from)
            .collect();
        stats.global_windows = global_rows.len() as u64;
        stats.country_windows = country_rows.len() as u64;
        stats.watermark_before = watermark_before;
        stats.watermark_after = watermark_after;
        next.position = batch.next_position;

        let mut outputs = Vec::with_capacity(3);
        if self.router.has(CONSOLE) {
            let raw = transactions
                .iter()
                .map(|txn| OutputRecord::from(EnrichedRecord::from(txn)))
                .collect();
            outputs.push((CONSOLE.to_string(), raw));
        }
        outputs.push((GLOBAL_KPI.to_string(), global_rows));
        outputs.push((COUNTRY_KPI.to_string(), country_rows));
        self.router.deliver(trigger_id, outputs).await?;

        next.last_committed_trigger_id = trigger_id;
        self.checkpoints.commit(&next.to_checkpoint(trigger_id)).await?;
        self.state = next;

        self.metrics.records_read.inc_by(stats.records_read);
        self.metrics.records_decoded.inc_by(stats.records_decoded);
        for kind in decode_failures {
            self.metrics.record_decode_error(kind);
        }
        for (aggregator, late) in [(GLOBAL_KPI, stats.global_late), (COUNTRY_KPI, stats.country_late)] {
            self.metrics.record_ingest(aggregator, late.folded, late.dropped);
        }
        self.metrics.source_gaps.inc_by(stats.gaps);
        self.metrics.set_watermark(watermark_after);
        self.metrics
            .record_finalized(GLOBAL_KPI, stats.global_windows, self.state.global.open_windows());
        self.metrics
            .record_finalized(COUNTRY_KPI, stats.country_windows, self.state.country.open_windows());

        Ok(TickOutcome::Committed(stats))
    }

    /// Read from `position`, retrying transient failures with backoff
    ///
    /// Once retries run out the tick either fails (`fail_on_data_loss`) or
    /// skips to the next readable position.
    async fn read_with_retry(&self, position: &SourcePosition) -> Result<SourceBatch> {
        let source_config = &self.config.source;
        let max_events = self.config.trigger.max_events_per_tick;
        let mut retries = 0u32;

        loop {
            let err = match self.source.read_from(position, max_events).await {
                Ok(batch) => return Ok(batch),
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err.into()),
            };

            if retries < source_config.max_retries {
                retries += 1;
                let backoff = source_config
                    .retry_backoff()
                    .saturating_mul(2u32.saturating_pow(retries - 1))
                    .min(Duration::from_secs(60));
                warn!(
                    "Read from '{}' failed (retry {}/{}), retrying in {:?}: {}",
                    self.source.name(),
                    retries,
                    source_config.max_retries,
                    backoff,
                    err
                );
                sleep(backoff).await;
                continue;
            }

            if source_config.fail_on_data_loss {
                return Err(SourceError::Exhausted {
                    attempts: retries + 1,
                    message: err.to_string(),
                }
                .into());
            }

            let next_position = self.source.next_available(position).await?;
            warn!(
                source = self.source.name(),
                from = %position,
                to = %next_position,
                error = %err,
                "Source retries exhausted, skipping to next available position"
            );
            return Ok(SourceBatch {
                next_position,
                ..Default::default()
            });
        }
    }
}
