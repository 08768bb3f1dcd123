//! Query results export (CSV / JSON / JSON lines)
//!
//! Writers are incremental: a header, any number of row batches, then a
//! footer, so an export never holds more than one batch in memory.

use crate::db::{ColumnDef, Row};
use crate::engine::StatementStatus;
use crate::error::{ConfigError, Result, VizdbError};
use crate::results::RowCursor;
use std::io::Write;
use std::str::FromStr;

/// Export format selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    /// One JSON array of objects
    Json,
    /// One JSON object per line
    JsonLines,
}

impl ExportFormat {
    /// File extension for this format (without leading dot)
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
            ExportFormat::JsonLines => "jsonl",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = VizdbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            "jsonl" | "ndjson" | "json-lines" => Ok(ExportFormat::JsonLines),
            other => Err(ConfigError::Invalid(format!("unknown export format: {}", other)).into()),
        }
    }
}

/// Streaming writer for one format
pub struct ExportWriter<W: Write> {
    format: ExportFormat,
    out: W,
    columns: Vec<String>,
    rows: u64,
}

impl<W: Write> ExportWriter<W> {
    /// Write the header (CSV column names, the opening `[` for JSON)
    pub fn begin(format: ExportFormat, columns: &[ColumnDef], mut out: W) -> Result<Self> {
        let columns: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        match format {
            ExportFormat::Csv if !columns.is_empty() => {
                let mut line = String::new();
                push_csv_record(&mut line, columns.iter().map(String::as_str));
                out.write_all(line.as_bytes())?;
            }
            ExportFormat::Json => out.write_all(b"[")?,
            _ => {}
        }
        Ok(Self {
            format,
            out,
            columns,
            rows: 0,
        })
    }

    pub fn write_rows(&mut self, rows: &[Row]) -> Result<()> {
        let mut buf = String::new();
        for row in rows {
            match self.format {
                ExportFormat::Csv => {
                    let cells: Vec<String> = row.values.iter().map(|c| c.export_string()).collect();
                    push_csv_record(&mut buf, cells.iter().map(String::as_str));
                }
                ExportFormat::Json => {
                    buf.push_str(if self.rows == 0 { "\n  " } else { ",\n  " });
                    buf.push_str(&self.object(row).to_string());
                }
                ExportFormat::JsonLines => {
                    buf.push_str(&self.object(row).to_string());
                    buf.push('\n');
                }
            }
            self.rows += 1;
        }
        self.out.write_all(buf.as_bytes())?;
        Ok(())
    }

    /// Write the footer and hand back the sink
    pub fn finish(mut self) -> Result<W> {
        if self.format == ExportFormat::Json {
            let close: &[u8] = if self.rows == 0 { b"]\n" } else { b"\n]\n" };
            self.out.write_all(close)?;
        }
        self.out.flush()?;
        Ok(self.out)
    }

    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    fn object(&self, row: &Row) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        for (i, cell) in row.values.iter().enumerate() {
            let key = self.columns.get(i).map(String::as_str).unwrap_or("?");
            obj.insert(key.to_string(), cell.to_json());
        }
        serde_json::Value::Object(obj)
    }
}

/// Drain a statement's rows into `out`
///
/// Returns the writer's sink and the row count. A statement that failed
/// or was cancelled still leaves a well-formed file with the rows that
/// arrived; its status is reported as the error.
pub async fn export<W: Write>(
    mut cursor: RowCursor,
    format: ExportFormat,
    out: W,
) -> Result<(W, u64)> {
    let columns = cursor.columns().await;
    let mut writer = ExportWriter::begin(format, &columns, out)?;
    while let Some(batch) = cursor.next_batch().await {
        writer.write_rows(&batch)?;
    }
    let rows = writer.rows_written();
    let out = writer.finish()?;
    tracing::info!(rows, format = format.extension(), "export finished");
    match cursor.finish().await {
        StatementStatus::Failed(e) => Err(e.into()),
        StatementStatus::Cancelled => Err(VizdbError::Statement(
            crate::error::StatementError::driver("export cancelled"),
        )),
        _ => Ok((out, rows)),
    }
}

fn push_csv_record<'a>(out: &mut String, fields: impl Iterator<Item = &'a str>) {
    for (i, field) in fields.enumerate() {
        if i > 0 {
            out.push(',');
        }
        csv_escape_into(out, field);
    }
    out.push('\n');
}

/// Quote a field if it contains `,` `"` or a newline (RFC 4180).
fn csv_escape_into(out: &mut String, field: &str) {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        out.push('"');
        for c in field.chars() {
            if c == '"' {
                out.push_str("\"\"");
            } else {
                out.push(c);
            }
        }
        out.push('"');
    } else {
        out.push_str(field);
    }
}
