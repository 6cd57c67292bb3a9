//! Fan-out of a tick's output to its destinations

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use super::{DeliveryGuarantee, OutputRecord, Sink, SinkBatch};
use crate::error::{SinkError, SinkResult};
use crate::metrics::EngineMetrics;

/// Upper bound of one backoff delay
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Summary of a successful delivery round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Destinations that acknowledged their batch
    pub delivered: Vec<String>,
    /// Best-effort destinations that failed
    pub best_effort_failures: Vec<String>,
    /// Records acknowledged across all destinations
    pub records: usize,
}

/// Routes per-destination batches to registered sinks
///
/// Destinations are delivered concurrently, at most `parallelism` at a time,
/// and all of them are joined before [`deliver`](Self::deliver) returns.
pub struct SinkRouter {
    sinks: BTreeMap<String, Arc<dyn Sink>>,
    max_attempts: u32,
    base_backoff: Duration,
    parallelism: usize,
    metrics: EngineMetrics,
}

impl SinkRouter {
    pub fn new(max_attempts: u32, base_backoff: Duration, parallelism: usize) -> Self {
        Self {
            sinks: BTreeMap::new(),
            max_attempts: max_attempts.max(1),
            base_backoff,
            parallelism: parallelism.max(1),
            metrics: EngineMetrics::default(),
        }
    }

    /// Record delivery failures in `metrics`
    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Register a sink under its name, replacing any sink with that name
    pub fn register(&mut self, sink: Arc<dyn Sink>) {
        self.sinks.insert(sink.name().to_string(), sink);
    }

    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.register(sink);
        self
    }

    /// Whether a destination is registered
    pub fn has(&self, destination: &str) -> bool {
        self.sinks.contains_key(destination)
    }

    /// Registered destination names
    pub fn destinations(&self) -> impl Iterator<Item = &str> {
        self.sinks.keys().map(String::as_str)
    }

    /// Exponential backoff before retry number `retry_count`
    fn calculate_backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count.saturating_sub(1).min(16));
        self.base_backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// Deliver one batch with retries
    async fn deliver_with_retry(
        sink: Arc<dyn Sink>,
        batch: Arc<SinkBatch>,
        max_attempts: u32,
        backoff: Vec<Duration>,
    ) -> SinkResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match sink.deliver(&batch).await {
                Ok(()) => {
                    if attempt > 1 {
                        debug!(sink = sink.name(), attempt, "Batch delivered after retries");
                    }
                    return Ok(());
                }
                Err(err) if attempt >= max_attempts => {
                    return Err(SinkError::RetriesExhausted {
                        sink: sink.name().to_string(),
                        attempts: attempt,
                        last_error: err.to_string(),
                    });
                }
                Err(err) => {
                    let delay = backoff
                        .get(attempt as usize - 1)
                        .copied()
                        .unwrap_or(MAX_BACKOFF);
                    warn!(
                        "Delivery to '{}' failed (attempt {}/{}), retrying in {:?}: {}",
                        sink.name(),
                        attempt,
                        max_attempts,
                        delay,
                        err
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Deliver every `(destination, records)` pair under `trigger_id`
    ///
    /// Fails if any idempotent destination still fails after its retries.
    /// Best-effort failures are logged and reported but never fail the round.
    pub async fn deliver(
        &self,
        trigger_id: u64,
        outputs: Vec<(String, Vec<OutputRecord>)>,
    ) -> SinkResult<DeliveryReport> {
        let mut routed = Vec::with_capacity(outputs.len());
        for (destination, records) in outputs {
            let sink = self.sinks.get(&destination).cloned().ok_or_else(|| SinkError::Write {
                sink: destination.clone(),
                reason: "no sink registered for this destination".to_string(),
            })?;
            routed.push((sink, Arc::new(SinkBatch::new(trigger_id, records))));
        }

        let backoff: Vec<Duration> = (1..self.max_attempts)
            .map(|retry| self.calculate_backoff(retry))
            .collect();
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut workers = JoinSet::new();

        for (sink, batch) in routed {
            let semaphore = Arc::clone(&semaphore);
            let backoff = backoff.clone();
            let max_attempts = self.max_attempts;
            workers.spawn(async move {
                let records = batch.len();
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => {
                        Self::deliver_with_retry(Arc::clone(&sink), batch, max_attempts, backoff).await
                    }
                    Err(e) => Err(SinkError::Write {
                        sink: sink.name().to_string(),
                        reason: e.to_string(),
                    }),
                };
                (sink.name().to_string(), sink.guarantee(), records, result)
            });
        }

        let mut report = DeliveryReport::default();
        let mut first_failure: Option<SinkError> = None;
        while let Some(joined) = workers.join_next().await {
            let (name, guarantee, records, result) = joined.map_err(|e| SinkError::Write {
                sink: "router".to_string(),
                reason: format!("delivery worker failed: {}", e),
            })?;
            match (result, guarantee) {
                (Ok(()), _) => {
                    report.records += records;
                    report.delivered.push(name);
                }
                (Err(err), DeliveryGuarantee::BestEffort) => {
                    warn!(sink = %name, error = %err, "Best-effort delivery failed, continuing");
                    self.metrics.record_sink_failure(&name);
                    report.best_effort_failures.push(name);
                }
                (Err(err), DeliveryGuarantee::Idempotent) => {
                    error!(sink = %name, trigger_id, error = %err, "Durable delivery failed");
                    self.metrics.record_sink_failure(&name);
                    first_failure.get_or_insert(err);
                }
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => {
                report.delivered.sort();
                report.best_effort_failures.sort();
                Ok(report)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Sink that fails a configured number of times, then records batches
    struct FlakySink {
        name: String,
        guarantee: DeliveryGuarantee,
        failures_left: AtomicU32,
        attempts: AtomicU32,
        delivered: Mutex<Vec<u64>>,
    }

    impl FlakySink {
        fn new(name: &str, guarantee: DeliveryGuarantee, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                guarantee,
                failures_left: AtomicU32::new(failures),
                attempts: AtomicU32::new(0),
                delivered: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Sink for FlakySink {
        fn name(&self) -> &str {
            &self.name
        }

        fn guarantee(&self) -> DeliveryGuarantee {
            self.guarantee
        }

        async fn deliver(&self, batch: &SinkBatch) -> SinkResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(SinkError::Write {
                    sink: self.name.clone(),
                    reason: "injected".to_string(),
                });
            }
            self.delivered.lock().push(batch.trigger_id);
            Ok(())
        }
    }

    fn router() -> SinkRouter {
        SinkRouter::new(3, Duration::from_millis(1), 2)
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let sink = FlakySink::new("global_kpi", DeliveryGuarantee::Idempotent, 2);
        let router = router().with_sink(sink.clone());

        let report = router
            .deliver(4, vec![("global_kpi".to_string(), Vec::new())])
            .await
            .unwrap();
        assert_eq!(report.delivered, vec!["global_kpi".to_string()]);
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(*sink.delivered.lock(), vec![4]);
    }

    #[tokio::test]
    async fn test_durable_failure_fails_round() {
        let durable = FlakySink::new("country_kpi", DeliveryGuarantee::Idempotent, 10);
        let other = FlakySink::new("global_kpi", DeliveryGuarantee::Idempotent, 0);
        let metrics = EngineMetrics::default();
        let router = router()
            .with_metrics(metrics.clone())
            .with_sink(durable.clone())
            .with_sink(other.clone());

        let err = router
            .deliver(
                1,
                vec![
                    ("country_kpi".to_string(), Vec::new()),
                    ("global_kpi".to_string(), Vec::new()),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(durable.attempts.load(Ordering::SeqCst), 3);
        // The healthy sink was still joined before returning
        assert_eq!(*other.delivered.lock(), vec![1]);
        assert_eq!(
            metrics
                .sink_failures
                .get_or_create(&crate::metrics::SinkLabels { sink: "country_kpi".to_string() })
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_best_effort_failure_is_reported_only() {
        let console = FlakySink::new("console", DeliveryGuarantee::BestEffort, 10);
        let durable = FlakySink::new("global_kpi", DeliveryGuarantee::Idempotent, 0);
        let router = router().with_sink(console).with_sink(durable);

        let report = router
            .deliver(
                2,
                vec![
                    ("console".to_string(), Vec::new()),
                    ("global_kpi".to_string(), Vec::new()),
                ],
            )
            .await
            .unwrap();
        assert_eq!(report.delivered, vec!["global_kpi".to_string()]);
        assert_eq!(report.best_effort_failures, vec!["console".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_destination() {
        let err = router()
            .deliver(1, vec![("nowhere".to_string(), Vec::new())])
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Write { ref sink, .. } if sink == "nowhere"));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let router = SinkRouter::new(20, Duration::from_millis(200), 1);
        assert_eq!(router.calculate_backoff(1), Duration::from_millis(200));
        assert_eq!(router.calculate_backoff(2), Duration::from_millis(400));
        assert_eq!(router.calculate_backoff(3), Duration::from_millis(800));
        assert_eq!(router.calculate_backoff(15), MAX_BACKOFF);
    }
}
