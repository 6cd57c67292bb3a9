//! Kafka topic source
//!
//! Partitions are assigned manually at the offsets the engine checkpointed;
//! consumer-group offsets are never committed. Each read snapshots the
//! partition high watermarks and consumes up to them, so one tick reads a
//! bounded range. A low watermark above the requested offset means retention
//! already removed records, which is reported as a gap.

use super::{explicit_offsets, plan_read, EventSource, RawEvent, SourceBatch, SourcePosition};
use crate::config::StartPosition;
use crate::error::{SourceError, SourceResult};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::{Message, Offset, TopicPartitionList};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Timeout for metadata and watermark requests
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll timeout for a single message
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Upper bound on one read
const READ_DEADLINE: Duration = Duration::from_secs(30);

fn transient(err: KafkaError) -> SourceError {
    SourceError::Transient {
        message: err.to_string(),
    }
}

/// Source consuming one Kafka topic
pub struct KafkaSource {
    name: String,
    topic: String,
    consumer: Arc<BaseConsumer>,
}

impl KafkaSource {
    /// Create the consumer; no partitions are assigned until the first read
    pub fn new(
        brokers: &str,
        topic: &str,
        group_id: &str,
        properties: &BTreeMap<String, String>,
    ) -> SourceResult<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false") // Positions live in the engine checkpoint
            .set("enable.partition.eof", "false");

        for (key, value) in properties {
            client_config.set(key, value);
        }

        let consumer: BaseConsumer = client_config.create().map_err(|e| SourceError::Client {
            message: e.to_string(),
        })?;

        info!(brokers, topic, "Created Kafka source");
        Ok(Self {
            name: format!("kafka:{}", topic),
            topic: topic.to_string(),
            consumer: Arc::new(consumer),
        })
    }

    /// Run a blocking client call on the blocking pool
    async fn blocking<T, F>(&self, f: F) -> SourceResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&BaseConsumer, &str) -> SourceResult<T> + Send + 'static,
    {
        let consumer = Arc::clone(&self.consumer);
        let topic = self.topic.clone();
        tokio::task::spawn_blocking(move || f(&consumer, &topic))
            .await
            .map_err(|e| SourceError::Client {
                message: format!("kafka worker failed: {}", e),
            })?
    }
}

/// `(low, high)` watermarks for every partition of the topic
fn partition_watermarks(consumer: &BaseConsumer, topic: &str) -> SourceResult<BTreeMap<u32, (i64, i64)>> {
    let metadata = consumer
        .fetch_metadata(Some(topic), METADATA_TIMEOUT)
        .map_err(transient)?;

    let mut watermarks = BTreeMap::new();
    for topic_metadata in metadata.topics() {
        for partition in topic_metadata.partitions() {
            let bounds = consumer
                .fetch_watermarks(topic, partition.id(), METADATA_TIMEOUT)
                .map_err(transient)?;
            watermarks.insert(partition.id() as u32, bounds);
        }
    }
    if watermarks.is_empty() {
        return Err(SourceError::Transient {
            message: format!("no partitions found for topic '{}'", topic),
        });
    }
    Ok(watermarks)
}

#[async_trait]
impl EventSource for KafkaSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve_start(&self, start: &StartPosition) -> SourceResult<SourcePosition> {
        if let Some(position) = explicit_offsets(start) {
            return Ok(position);
        }
        let latest = matches!(start, StartPosition::Latest);
        self.blocking(move |consumer, topic| {
            let watermarks = partition_watermarks(consumer, topic)?;
            Ok(SourcePosition::from_offsets(
                watermarks
                    .into_iter()
                    .map(|(p, (low, high))| (p, if latest { high } else { low })),
            ))
        })
        .await
    }

    async fn read_from(
        &self,
        position: &SourcePosition,
        max_events: Option<usize>,
    ) -> SourceResult<SourceBatch> {
        let position = position.clone();
        self.blocking(move |consumer, topic| {
            let watermarks = partition_watermarks(consumer, topic)?;

            let plan = plan_read(&watermarks, &position, max_events);
            let mut batch = SourceBatch {
                next_position: plan.next_position.clone(),
                gaps: plan.gaps.clone(),
                ..Default::default()
            };
            if plan.is_empty() {
                return Ok(batch);
            }

            let mut targets: HashMap<i32, i64> = HashMap::new();
            let mut tpl = TopicPartitionList::new();
            for (partition, (start, end)) in &plan.ranges {
                targets.insert(*partition as i32, *end);
                tpl.add_partition_offset(topic, *partition as i32, Offset::Offset(*start))
                    .map_err(transient)?;
            }
            consumer.assign(&tpl).map_err(transient)?;

            let mut received: BTreeMap<(u32, i64), Vec<u8>> = BTreeMap::new();
            let deadline = Instant::now() + READ_DEADLINE;
            while !targets.is_empty() {
                if Instant::now() > deadline {
                    return Err(SourceError::Transient {
                        message: "timed out reading up to the high watermark".to_string(),
                    });
                }
                let Some(result) = consumer.poll(POLL_TIMEOUT) else {
                    continue;
                };
                let msg = result.map_err(transient)?;
                let partition = msg.partition();
                let Some(target) = targets.get(&partition).copied() else {
                    continue;
                };
                if msg.offset() < target {
                    let payload = msg.payload().map(<[u8]>::to_vec).unwrap_or_default();
                    received.insert((partition as u32, msg.offset()), payload);
                }
                if msg.offset() + 1 >= target {
                    targets.remove(&partition);
                }
            }
            consumer.unassign().map_err(transient)?;

            // Offsets missing below a target (compaction, control records) are
            // covered by the planned next position
            for ((partition, offset), payload) in received {
                batch.events.push(RawEvent::new(partition, offset, payload));
            }
            debug!(events = batch.events.len(), position = %batch.next_position, "Read from Kafka");
            Ok(batch)
        })
        .await
    }

    async fn next_available(&self, position: &SourcePosition) -> SourceResult<SourcePosition> {
        let position = position.clone();
        self.blocking(move |consumer, topic| {
            let watermarks = partition_watermarks(consumer, topic)?;
            let mut next = position.clone();
            for (partition, (low, _)) in watermarks {
                let offset = position.get(partition).unwrap_or(low);
                next.set(partition, offset.max(low));
            }
            Ok(next)
        })
        .await
    }
}
