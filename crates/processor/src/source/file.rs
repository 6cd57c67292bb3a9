//! JSON-lines file source
//!
//! The file is a single partition (0) whose offsets are line indices. Only
//! newline-terminated lines are readable; a trailing partial line is picked up
//! once its producer finishes writing it.

use super::{explicit_offsets, EventSource, RawEvent, SourceBatch, SourceGap, SourcePosition};
use crate::config::StartPosition;
use crate::error::SourceResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tracing::{debug, warn};

const PARTITION: u32 = 0;

/// Line and byte offset of the first unread line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct FileCursor {
    line: i64,
    byte: u64,
}

#[derive(Debug, Default)]
struct Scan {
    events: Vec<RawEvent>,
    end: FileCursor,
}

/// Source reading a growing JSON-lines file
#[derive(Debug)]
pub struct FileSource {
    name: String,
    path: PathBuf,
    /// Where the last read stopped, to avoid rescanning from the start
    cursor: Mutex<Option<FileCursor>>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: format!("file:{}", path.display()),
            path,
            cursor: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read complete lines, collecting those at or after `start_line`
    async fn scan(&self, start_line: i64, max_events: Option<usize>, collect: bool) -> SourceResult<Scan> {
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Input file does not exist yet");
                return Ok(Scan::default());
            }
            Err(err) => return Err(err.into()),
        };
        let len = file.metadata().await?.len();

        let cached = *self.cursor.lock();
        let mut cursor = match cached {
            Some(c) if c.line <= start_line && c.byte <= len => c,
            _ => FileCursor::default(),
        };
        if cursor.byte > 0 {
            file.seek(SeekFrom::Start(cursor.byte)).await?;
        }

        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut buf = Vec::new();
        loop {
            if max_events.map_or(false, |max| events.len() >= max) {
                break;
            }
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf).await?;
            if n == 0 || buf.last() != Some(&b'\n') {
                break;
            }

            let line = cursor.line;
            cursor.line += 1;
            cursor.byte += n as u64;

            if !collect || line < start_line {
                continue;
            }
            let payload = trim_line(&buf);
            if payload.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            events.push(RawEvent::new(PARTITION, line, payload));
        }

        *self.cursor.lock() = Some(cursor);
        Ok(Scan {
            events,
            end: cursor,
        })
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[async_trait]
impl EventSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve_start(&self, start: &StartPosition) -> SourceResult<SourcePosition> {
        if let Some(position) = explicit_offsets(start) {
            let line = position.get(PARTITION).unwrap_or(0);
            return Ok(SourcePosition::from_offsets([(PARTITION, line)]));
        }
        let line = match start {
            StartPosition::Latest => self.scan(i64::MAX, None, false).await?.end.line,
            _ => 0,
        };
        Ok(SourcePosition::from_offsets([(PARTITION, line)]))
    }

    async fn read_from(
        &self,
        position: &SourcePosition,
        max_events: Option<usize>,
    ) -> SourceResult<SourceBatch> {
        let start_line = position.get(PARTITION).unwrap_or(0);
        let scan = self.scan(start_line, max_events, true).await?;

        let mut gaps = Vec::new();
        let next_line = if scan.end.line < start_line {
            let gap = SourceGap {
                partition: PARTITION,
                expected: start_line,
                resumed_at: scan.end.line,
            };
            warn!(source = %self.name, %gap, "Input file is shorter than the committed position");
            gaps.push(gap);
            scan.end.line
        } else {
            scan.end.line.max(start_line)
        };

        Ok(SourceBatch {
            events: scan.events,
            next_position: SourcePosition::from_offsets([(PARTITION, next_line)]),
            gaps,
        })
    }

    async fn next_available(&self, position: &SourcePosition) -> SourceResult<SourcePosition> {
        let start_line = position.get(PARTITION).unwrap_or(0);
        let lines = self.scan(i64::MAX, None, false).await?.end.line;
        Ok(SourcePosition::from_offsets([(PARTITION, start_line.min(lines))]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("file_source_{}.jsonl", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn payloads(batch: &SourceBatch) -> Vec<String> {
        batch
            .events
            .iter()
            .map(|e| String::from_utf8(e.payload.clone()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_reads_complete_lines_only() {
        let path = temp_file("{\"a\":1}\n{\"a\":2}\n{\"a\":3");
        let source = FileSource::new(&path);

        let batch = source.read_from(&SourcePosition::new(), None).await.unwrap();
        assert_eq!(payloads(&batch), vec!["{\"a\":1}", "{\"a\":2}"]);
        assert_eq!(batch.next_position.get(0), Some(2));

        // Finish the partial line
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"}\n").unwrap();

        let batch = source.read_from(&batch.next_position, None).await.unwrap();
        assert_eq!(payloads(&batch), vec!["{\"a\":3}"]);
        assert_eq!(batch.events[0].offset, 2);
        assert_eq!(batch.next_position.get(0), Some(3));

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_max_events_and_replay() {
        let path = temp_file("a\nb\nc\nd\n");
        let source = FileSource::new(&path);
        let start = SourcePosition::from_offsets([(0, 1)]);

        let first = source.read_from(&start, Some(2)).await.unwrap();
        assert_eq!(payloads(&first), vec!["b", "c"]);
        assert_eq!(first.next_position.get(0), Some(3));

        // Same position, same records, even with a cursor past it
        let replay = source.read_from(&start, Some(2)).await.unwrap();
        assert_eq!(payloads(&replay), payloads(&first));

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_blank_lines_consume_offsets() {
        let path = temp_file("a\n\r\n\nb\r\n");
        let source = FileSource::new(&path);

        let batch = source.read_from(&SourcePosition::new(), None).await.unwrap();
        assert_eq!(payloads(&batch), vec!["a", "b"]);
        assert_eq!(batch.events[1].offset, 3);
        assert_eq!(batch.next_position.get(0), Some(4));

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_truncated_file_is_a_gap() {
        let path = temp_file("a\nb\n");
        let source = FileSource::new(&path);

        let batch = source
            .read_from(&SourcePosition::from_offsets([(0, 5)]), None)
            .await
            .unwrap();
        assert!(batch.events.is_empty());
        assert_eq!(
            batch.gaps,
            vec![SourceGap {
                partition: 0,
                expected: 5,
                resumed_at: 2
            }]
        );
        assert_eq!(batch.next_position.get(0), Some(2));

        let next = source
            .next_available(&SourcePosition::from_offsets([(0, 5)]))
            .await
            .unwrap();
        assert_eq!(next.get(0), Some(2));

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_resolve_start() {
        let path = temp_file("a\nb\nc\n");
        let source = FileSource::new(&path);

        let earliest = source.resolve_start(&StartPosition::Earliest).await.unwrap();
        assert_eq!(earliest.get(0), Some(0));

        let latest = source.resolve_start(&StartPosition::Latest).await.unwrap();
        assert_eq!(latest.get(0), Some(3));

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_missing_file_reads_nothing() {
        let source = FileSource::new(std::env::temp_dir().join(format!("missing_{}", uuid::Uuid::new_v4())));
        let batch = source.read_from(&SourcePosition::new(), None).await.unwrap();
        assert!(batch.events.is_empty());
        assert_eq!(batch.next_position.get(0), Some(0));
    }
}
