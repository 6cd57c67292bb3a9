//! Engine metric families

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;

use super::MetricsRegistry;
use crate::watermark::Watermark;

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AggregatorLabels {
    pub aggregator: String,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DecodeErrorLabels {
    pub kind: String,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TickLabels {
    pub outcome: String,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SinkLabels {
    pub sink: String,
}

/// Counters and gauges of one engine
///
/// Handles are cheap to clone and share the underlying values. A default
/// instance is fully functional but exported nowhere until
/// [`register`](Self::register) is called.
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    pub records_read: Counter,
    pub records_decoded: Counter,
    pub decode_errors: Family<DecodeErrorLabels, Counter>,
    pub late_dropped: Family<AggregatorLabels, Counter>,
    pub late_folded: Family<AggregatorLabels, Counter>,
    pub windows_finalized: Family<AggregatorLabels, Counter>,
    pub ticks: Family<TickLabels, Counter>,
    pub sink_failures: Family<SinkLabels, Counter>,
    pub source_gaps: Counter,
    pub watermark_ms: Gauge,
    pub open_windows: Family<AggregatorLabels, Gauge>,
}

impl EngineMetrics {
    /// Create the families and register them
    pub fn new(registry: &MetricsRegistry) -> Self {
        let metrics = Self::default();
        metrics.register(registry);
        metrics
    }

    /// Export every family through `registry`
    pub fn register(&self, registry: &MetricsRegistry) {
        registry.register("records_read", "Raw records read from the source", self.records_read.clone());
        registry.register("records_decoded", "Records decoded and enriched", self.records_decoded.clone());
        registry.register("decode_errors", "Records dropped by the decoder", self.decode_errors.clone());
        registry.register("late_dropped", "Events dropped because their window was closed", self.late_dropped.clone());
        registry.register("late_folded", "Late events folded into a still-open window", self.late_folded.clone());
        registry.register("windows_finalized", "Windows finalized and emitted", self.windows_finalized.clone());
        registry.register("ticks", "Ticks by outcome", self.ticks.clone());
        registry.register("sink_failures", "Failed sink deliveries after retries", self.sink_failures.clone());
        registry.register("source_gaps", "Source ranges skipped as unavailable", self.source_gaps.clone());
        registry.register("watermark_ms", "Current watermark in epoch milliseconds", self.watermark_ms.clone());
        registry.register("open_windows", "Open windows per aggregator", self.open_windows.clone());
    }

    fn aggregator(name: &str) -> AggregatorLabels {
        AggregatorLabels {
            aggregator: name.to_string(),
        }
    }

    pub fn record_decode_error(&self, kind: &str) {
        self.decode_errors
            .get_or_create(&DecodeErrorLabels { kind: kind.to_string() })
            .inc();
    }

    pub fn record_ingest(&self, aggregator: &str, late_folded: u64, late_dropped: u64) {
        let labels = Self::aggregator(aggregator);
        self.late_folded.get_or_create(&labels).inc_by(late_folded);
        self.late_dropped.get_or_create(&labels).inc_by(late_dropped);
    }

    pub fn record_finalized(&self, aggregator: &str, windows: u64, open_windows: usize) {
        let labels = Self::aggregator(aggregator);
        self.windows_finalized.get_or_create(&labels).inc_by(windows);
        self.open_windows
            .get_or_create(&labels)
            .set(i64::try_from(open_windows).unwrap_or(i64::MAX));
    }

    pub fn record_tick(&self, outcome: &str) {
        self.ticks
            .get_or_create(&TickLabels { outcome: outcome.to_string() })
            .inc();
    }

    pub fn record_sink_failure(&self, sink: &str) {
        self.sink_failures
            .get_or_create(&SinkLabels { sink: sink.to_string() })
            .inc();
    }

    /// The minimum watermark is exported as 0
    pub fn set_watermark(&self, watermark: Watermark) {
        self.watermark_ms
            .set(if watermark.is_min() { 0 } else { watermark.timestamp });
    }

    /// Committed ticks with `outcome`
    pub fn ticks_with_outcome(&self, outcome: &str) -> u64 {
        self.ticks
            .get_or_create(&TickLabels { outcome: outcome.to_string() })
            .get()
    }

    /// Late drops recorded for `aggregator`
    pub fn late_dropped_for(&self, aggregator: &str) -> u64 {
        self.late_dropped.get_or_create(&Self::aggregator(aggregator)).get()
    }

    /// Decode errors of `kind`
    pub fn decode_errors_of(&self, kind: &str) -> u64 {
        self.decode_errors
            .get_or_create(&DecodeErrorLabels { kind: kind.to_string() })
            .get()
    }
}
