//! Partitioned JSON-lines file sink
//!
//! Each trigger owns one directory, `<path>/batch-<trigger_id>/`, holding a
//! single `part-00000.json`. A retried trigger rewrites the same file, so the
//! output of a trigger id is whatever its last successful delivery wrote.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{DeliveryGuarantee, Sink, SinkBatch};
use crate::error::{SinkError, SinkResult};

const PART_FILE: &str = "part-00000.json";

/// Durable, idempotent file sink
#[derive(Debug, Clone)]
pub struct FileSink {
    name: String,
    path: PathBuf,
}

impl FileSink {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Output root
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory of one trigger's output
    pub fn batch_dir(&self, trigger_id: u64) -> PathBuf {
        self.path.join(format!("batch-{}", trigger_id))
    }

    /// Output file of one trigger
    pub fn batch_file(&self, trigger_id: u64) -> PathBuf {
        self.batch_dir(trigger_id).join(PART_FILE)
    }

    fn write_error(&self, path: &Path, err: std::io::Error) -> SinkError {
        SinkError::Write {
            sink: self.name.clone(),
            reason: format!("{}: {}", path.display(), err),
        }
    }

    /// Remove output left by an earlier attempt of the same trigger
    async fn remove_stale(&self, trigger_id: u64) -> SinkResult<()> {
        let dir = self.batch_dir(trigger_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(sink = %self.name, trigger_id, "Removed stale batch output");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.write_error(&dir, err)),
        }
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn guarantee(&self) -> DeliveryGuarantee {
        DeliveryGuarantee::Idempotent
    }

    async fn deliver(&self, batch: &SinkBatch) -> SinkResult<()> {
        if batch.is_empty() {
            return self.remove_stale(batch.trigger_id).await;
        }

        let bytes = batch.to_json_lines(&self.name)?;
        let dir = self.batch_dir(batch.trigger_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| self.write_error(&dir, e))?;

        let tmp_path = dir.join(format!(".{}.tmp", PART_FILE));
        let final_path = dir.join(PART_FILE);

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| self.write_error(&tmp_path, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| self.write_error(&tmp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| self.write_error(&tmp_path, e))?;
        drop(file);

        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| self.write_error(&final_path, e))?;

        debug!(
            sink = %self.name,
            trigger_id = batch.trigger_id,
            records = batch.len(),
            bytes = bytes.len(),
            "Wrote batch file"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::OutputRecord;
    use chrono::{TimeZone, Utc};
    use retail_kpi_types::EnrichedRecord;

    fn record(invoice_no: i64) -> OutputRecord {
        OutputRecord::Enriched(EnrichedRecord {
            invoice_no,
            country: "Spain".to_string(),
            timestamp: Utc.with_ymd_and_hms(2020, 9, 18, 6, 49, 43).unwrap(),
            total_cost: 3.5,
            total_items: 2,
            is_order: 1,
            is_return: 0,
        })
    }

    fn sink() -> FileSink {
        FileSink::new(
            "global_kpi",
            std::env::temp_dir().join(format!("file_sink_{}", uuid::Uuid::new_v4())),
        )
    }

    #[tokio::test]
    async fn test_writes_one_file_per_trigger() {
        let sink = sink();
        sink.deliver(&SinkBatch::new(7, vec![record(1), record(2)]))
            .await
            .unwrap();

        let text = tokio::fs::read_to_string(sink.batch_file(7)).await.unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(sink.batch_file(7).ends_with("batch-7/part-00000.json"));
        assert!(!sink.batch_dir(7).join(".part-00000.json.tmp").exists());

        tokio::fs::remove_dir_all(sink.path()).await.ok();
    }

    #[tokio::test]
    async fn test_redelivery_overwrites() {
        let sink = sink();
        sink.deliver(&SinkBatch::new(1, vec![record(1), record(2)]))
            .await
            .unwrap();
        sink.deliver(&SinkBatch::new(1, vec![record(1)])).await.unwrap();

        let text = tokio::fs::read_to_string(sink.batch_file(1)).await.unwrap();
        assert_eq!(text.lines().count(), 1);

        tokio::fs::remove_dir_all(sink.path()).await.ok();
    }

    #[tokio::test]
    async fn test_empty_batch_removes_stale_output() {
        let sink = sink();
        sink.deliver(&SinkBatch::new(2, vec![record(1)])).await.unwrap();
        assert!(sink.batch_file(2).exists());

        sink.deliver(&SinkBatch::new(2, Vec::new())).await.unwrap();
        assert!(!sink.batch_dir(2).exists());

        // Nothing to remove is fine too
        sink.deliver(&SinkBatch::new(3, Vec::new())).await.unwrap();

        tokio::fs::remove_dir_all(sink.path()).await.ok();
    }

    #[tokio::test]
    async fn test_unwritable_path_fails() {
        let blocker = std::env::temp_dir().join(format!("file_sink_blocker_{}", uuid::Uuid::new_v4()));
        std::fs::write(&blocker, b"not a directory").unwrap();

        let sink = FileSink::new("global_kpi", &blocker);
        let err = sink
            .deliver(&SinkBatch::new(1, vec![record(1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Write { .. }));

        std::fs::remove_file(&blocker).ok();
    }
}
