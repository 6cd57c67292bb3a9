//! Console debug sink
//!
//! Renders each batch as a `Batch: N` header followed by a fixed-width table:
//!
//! ```text
//! -------------------------------------------
//! Batch: 0
//! -------------------------------------------
//! +----------+--------------+
//! |invoice_no|       country|
//! +----------+--------------+
//! |  15413254|United Kingdom|
//! +----------+--------------+
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::Write;

use super::{DeliveryGuarantee, Sink, SinkBatch};
use crate::error::{SinkError, SinkResult};

/// Cells longer than this are cut when truncation is on
const TRUNCATE_WIDTH: usize = 20;

const RULE: &str = "-------------------------------------------";

/// Best-effort sink printing batches as tables
pub struct ConsoleSink<W: Write + Send> {
    name: String,
    truncate: bool,
    writer: Mutex<W>,
}

impl ConsoleSink<std::io::Stdout> {
    /// Console sink on standard output
    pub fn stdout(truncate: bool) -> Self {
        Self::new("console", std::io::stdout(), truncate)
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(name: impl Into<String>, writer: W, truncate: bool) -> Self {
        Self {
            name: name.into(),
            truncate,
            writer: Mutex::new(writer),
        }
    }

    /// Consume the sink and return its writer
    pub fn into_writer(self) -> W {
        self.writer.into_inner()
    }
}

fn truncate_cell(cell: String, truncate: bool) -> String {
    if !truncate || cell.chars().count() <= TRUNCATE_WIDTH {
        return cell;
    }
    let mut cut: String = cell.chars().take(TRUNCATE_WIDTH - 3).collect();
    cut.push_str("...");
    cut
}

fn format_row(cells: &[&str], widths: &[usize]) -> String {
    let mut line = String::new();
    for (cell, width) in cells.iter().zip(widths) {
        line.push('|');
        line.push_str(&" ".repeat(width.saturating_sub(cell.chars().count())));
        line.push_str(cell);
    }
    line.push_str("|\n");
    line
}

/// Render a batch the way the console sink prints it
pub fn render_table(batch: &SinkBatch, truncate: bool) -> String {
    let mut out = format!("{}\nBatch: {}\n{}\n", RULE, batch.trigger_id, RULE);

    let Some(first) = batch.records.first() else {
        out.push_str("(no rows)\n\n");
        return out;
    };
    let header: Vec<&str> = first.columns().into_iter().map(|(name, _)| name).collect();
    let rows: Vec<Vec<String>> = batch
        .records
        .iter()
        .map(|record| {
            record
                .columns()
                .into_iter()
                .map(|(_, cell)| truncate_cell(cell, truncate))
                .collect()
        })
        .collect();

    let mut widths: Vec<usize> = header.iter().map(|h| h.chars().count()).collect();
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let separator: String = widths
        .iter()
        .map(|w| format!("+{}", "-".repeat(*w)))
        .collect::<String>()
        + "+\n";
    out.push_str(&separator);
    out.push_str(&format_row(&header, &widths));
    out.push_str(&separator);
    for row in &rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        out.push_str(&format_row(&cells, &widths));
    }
    out.push_str(&separator);
    out.push('\n');
    out
}

#[async_trait]
impl<W: Write + Send> Sink for ConsoleSink<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn guarantee(&self) -> DeliveryGuarantee {
        DeliveryGuarantee::BestEffort
    }

    async fn deliver(&self, batch: &SinkBatch) -> SinkResult<()> {
        let table = render_table(batch, self.truncate);
        let mut writer = self.writer.lock();
        writer
            .write_all(table.as_bytes())
            .and_then(|()| writer.flush())
            .map_err(|e| SinkError::Write {
                sink: self.name.clone(),
                reason: e.to_string(),
            })
    }
}
