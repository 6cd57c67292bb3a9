//! Output destinations and the per-tick router
//!
//! Every tick hands the [`SinkRouter`] one batch per destination, all tagged
//! with the tick's trigger id. Durable sinks declare
//! [`DeliveryGuarantee::Idempotent`]: delivering the same trigger id twice
//! leaves the same output as delivering it once, which is what makes a
//! retried tick safe. Best-effort sinks may lose output and never fail a
//! tick.

use async_trait::async_trait;
use retail_kpi_types::{CountryKpiRecord, EnrichedRecord, GlobalKpiRecord};
use serde::Serialize;

use crate::error::{SinkError, SinkResult};

pub mod console;
pub mod file;
pub mod router;

pub use console::ConsoleSink;
pub use file::FileSink;
pub use router::{DeliveryReport, SinkRouter};

/// What a sink promises about a batch it acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryGuarantee {
    /// Failures are logged and the tick continues
    BestEffort,
    /// Redelivery under the same trigger id overwrites, never duplicates;
    /// failures abort the tick
    Idempotent,
}

/// One output row
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutputRecord {
    Enriched(EnrichedRecord),
    GlobalKpi(GlobalKpiRecord),
    CountryKpi(CountryKpiRecord),
}

impl OutputRecord {
    /// Column names and display values, in output order
    pub fn columns(&self) -> Vec<(&'static str, String)> {
        match self {
            OutputRecord::Enriched(r) => vec![
                ("invoice_no", r.invoice_no.to_string()),
                ("country", r.country.clone()),
                ("timestamp", r.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()),
                ("total_cost", r.total_cost.to_string()),
                ("total_items", r.total_items.to_string()),
                ("is_order", r.is_order.to_string()),
                ("is_return", r.is_return.to_string()),
            ],
            OutputRecord::GlobalKpi(r) => vec![
                ("window", window_cell(&r.window)),
                ("OPM", r.opm.to_string()),
                ("total_sale_volume", r.total_sale_volume.to_string()),
                ("average_transaction_size", r.average_transaction_size.to_string()),
                ("rate_of_return", r.rate_of_return.to_string()),
            ],
            OutputRecord::CountryKpi(r) => vec![
                ("window", window_cell(&r.window)),
                ("country", r.country.clone()),
                ("OPM", r.opm.to_string()),
                ("total_sale_volume", r.total_sale_volume.to_string()),
                ("rate_of_return", r.rate_of_return.to_string()),
            ],
        }
    }
}

fn window_cell(window: &retail_kpi_types::WindowSpan) -> String {
    format!(
        "[{}, {}]",
        window.start.format("%Y-%m-%d %H:%M:%S"),
        window.end.format("%Y-%m-%d %H:%M:%S")
    )
}

impl From<EnrichedRecord> for OutputRecord {
    fn from(record: EnrichedRecord) -> Self {
        OutputRecord::Enriched(record)
    }
}

impl From<GlobalKpiRecord> for OutputRecord {
    fn from(record: GlobalKpiRecord) -> Self {
        OutputRecord::GlobalKpi(record)
    }
}

impl From<CountryKpiRecord> for OutputRecord {
    fn from(record: CountryKpiRecord) -> Self {
        OutputRecord::CountryKpi(record)
    }
}

/// Records for one destination produced by one tick
#[derive(Debug, Clone, PartialEq)]
pub struct SinkBatch {
    pub trigger_id: u64,
    pub records: Vec<OutputRecord>,
}

impl SinkBatch {
    pub fn new(trigger_id: u64, records: Vec<OutputRecord>) -> Self {
        Self { trigger_id, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records as JSON lines, each terminated by `\n`
    pub fn to_json_lines(&self, sink: &str) -> SinkResult<Vec<u8>> {
        let mut buf = Vec::new();
        for record in &self.records {
            serde_json::to_writer(&mut buf, record).map_err(|e| SinkError::Serialization {
                sink: sink.to_string(),
                reason: e.to_string(),
            })?;
            buf.push(b'\n');
        }
        Ok(buf)
    }
}

/// An output destination
#[async_trait]
pub trait Sink: Send + Sync {
    /// Destination name, also the routing key
    fn name(&self) -> &str;

    /// Guarantee this sink provides
    fn guarantee(&self) -> DeliveryGuarantee;

    /// Deliver one batch; must be safe to repeat for an idempotent sink
    async fn deliver(&self, batch: &SinkBatch) -> SinkResult<()>;
}
