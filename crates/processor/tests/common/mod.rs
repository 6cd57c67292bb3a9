//! Shared fixtures for engine integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use processor::config::ProcessorConfig;
use processor::error::{SinkError, SinkResult};
use processor::metrics::EngineMetrics;
use processor::pipeline::{StreamEngine, COUNTRY_KPI, GLOBAL_KPI};
use processor::sink::{DeliveryGuarantee, FileSink, Sink, SinkBatch, SinkRouter};
use processor::source::MemorySource;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DAY: &str = "2020-09-18";

/// Temp directories, an in-memory source and a config wired to both
pub struct Harness {
    pub root: PathBuf,
    pub config: ProcessorConfig,
    pub source: MemorySource,
    pub metrics: EngineMetrics,
}

impl Harness {
    pub fn new(label: &str) -> Self {
        let root = std::env::temp_dir().join(format!("kpi_{}_{}", label, uuid::Uuid::new_v4()));

        let mut config = ProcessorConfig::default();
        config.window.size_ms = 60_000;
        config.window.allowed_lateness_ms = 60_000;
        config.trigger.interval_ms = 10;
        config.parallelism = 2;
        config.source.retry_backoff_ms = 1;
        config.sinks.console.enabled = false;
        config.sinks.retry_backoff_ms = 1;
        config.sinks.max_attempts = 2;
        config.sinks.global_kpi.path = root.join("time_kpi");
        config.sinks.global_kpi.checkpoint_path = root.join("time_kpi_checkpoints");
        config.sinks.country_kpi.path = root.join("country_kpi");
        config.sinks.country_kpi.checkpoint_path = root.join("country_kpi_checkpoints");
        config.checkpoint.path = root.join("engine_checkpoints");

        Self {
            root,
            config,
            source: MemorySource::new(1),
            metrics: EngineMetrics::default(),
        }
    }

    pub fn global_sink(&self) -> FileSink {
        FileSink::new(GLOBAL_KPI, &self.config.sinks.global_kpi.path)
    }

    pub fn country_sink(&self) -> FileSink {
        FileSink::new(COUNTRY_KPI, &self.config.sinks.country_kpi.path)
    }

    pub fn router(&self) -> SinkRouter {
        SinkRouter::new(
            self.config.sinks.max_attempts,
            self.config.sinks.retry_backoff(),
            self.config.parallelism,
        )
        .with_metrics(self.metrics.clone())
    }

    /// Engine with healthy file sinks
    pub async fn open(&self) -> StreamEngine {
        let router = self
            .router()
            .with_sink(Arc::new(self.global_sink()))
            .with_sink(Arc::new(self.country_sink()));
        self.open_with(router).await.unwrap()
    }

    pub async fn open_with(&self, router: SinkRouter) -> processor::ProcessorResult<StreamEngine> {
        StreamEngine::open(
            self.config.clone(),
            Arc::new(self.source.clone()),
            router,
            self.metrics.clone(),
        )
        .await
    }

    /// Append a transaction at `HH:MM:SS[.fff]` on [`DAY`]
    pub fn push(&self, invoice_no: i64, country: &str, time: &str, txn_type: &str, items: &[(f32, i32)]) {
        let items: Vec<serde_json::Value> = items
            .iter()
            .map(|(price, qty)| {
                serde_json::json!({"SKU": "21485", "title": "HOT WATER BOTTLE", "unit_price": price, "quantity": qty})
            })
            .collect();
        self.source.append_json(&serde_json::json!({
            "invoice_no": invoice_no,
            "country": country,
            "timestamp": format!("{} {}", DAY, time),
            "type": txn_type,
            "items": items,
        }));
    }

    pub fn order(&self, invoice_no: i64, country: &str, time: &str) {
        self.push(invoice_no, country, time, "ORDER", &[(1.0, 1)]);
    }

    /// Rows of every batch written to an output, in trigger order
    pub fn rows(&self, output: &Path) -> Vec<serde_json::Value> {
        batch_ids(output)
            .into_iter()
            .flat_map(|id| {
                let file = output.join(format!("batch-{}", id)).join("part-00000.json");
                std::fs::read_to_string(file)
                    .unwrap_or_default()
                    .lines()
                    .map(|line| serde_json::from_str(line).unwrap())
                    .collect::<Vec<serde_json::Value>>()
            })
            .collect()
    }

    pub fn global_rows(&self) -> Vec<serde_json::Value> {
        self.rows(&self.config.sinks.global_kpi.path)
    }

    pub fn country_rows(&self) -> Vec<serde_json::Value> {
        self.rows(&self.config.sinks.country_kpi.path)
    }

    pub fn batch_bytes(&self, output: &Path, trigger_id: u64) -> Option<Vec<u8>> {
        std::fs::read(output.join(format!("batch-{}", trigger_id)).join("part-00000.json")).ok()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.root).ok();
    }
}

/// Trigger ids that have a batch directory under `output`
pub fn batch_ids(output: &Path) -> Vec<u64> {
    let mut ids: Vec<u64> = std::fs::read_dir(output)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| {
                    entry
                        .file_name()
                        .to_str()
                        .and_then(|name| name.strip_prefix("batch-"))
                        .and_then(|id| id.parse().ok())
                })
                .collect()
        })
        .unwrap_or_default();
    ids.sort_unstable();
    ids
}

/// `window.start` of a KPI row
pub fn window_start(row: &serde_json::Value) -> String {
    row["window"]["start"].as_str().unwrap_or_default().to_string()
}

/// Durable sink that fails while `failures` is non-zero
pub struct FlakySink {
    inner: FileSink,
    failures: AtomicU32,
}

impl FlakySink {
    pub fn new(inner: FileSink, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures: AtomicU32::new(failures),
        })
    }

    pub fn fail(&self, failures: u32) {
        self.failures.store(failures, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl Sink for FlakySink {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn guarantee(&self) -> DeliveryGuarantee {
        DeliveryGuarantee::Idempotent
    }

    async fn deliver(&self, batch: &SinkBatch) -> SinkResult<()> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(SinkError::Write {
                sink: self.inner.name().to_string(),
                reason: "disk unavailable".to_string(),
            });
        }
        self.inner.deliver(batch).await
    }
}

pub fn interval() -> Duration {
    Duration::from_millis(10)
}
