//! Spreadsheet files: delimited text and Excel workbooks.

use crate::connectors::{header_names, record_to_row, stream_rows, Connector, RawRow, RowStream};
use crate::ingest::models::{DataSource, FileFormat, SourceConfig, SourceKind};
use crate::models::OrgId;
use crate::{Error, Result};
use async_trait::async_trait;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::{Duration, NaiveDate};
use serde_json::Value;
use std::io::Cursor;

/// Reads `csv_upload` sources from their stored file, or from uploaded bytes.
#[derive(Debug, Clone, Default)]
pub struct FileConnector;

impl FileConnector {
    pub fn new() -> Self {
        Self
    }

    /// Parse uploaded bytes. The first row is the header.
    #[tracing::instrument(level = "debug", skip(bytes), fields(len = bytes.len()))]
    pub fn parse(bytes: Vec<u8>, format: FileFormat, delimiter: Option<char>) -> Result<RowStream> {
        match format {
            FileFormat::Csv => parse_delimited(bytes, delimiter),
            FileFormat::Xlsx => parse_workbook(bytes).map(stream_rows),
        }
    }
}

#[async_trait]
impl Connector for FileConnector {
    fn kind(&self) -> SourceKind {
        SourceKind::CsvUpload
    }

    #[tracing::instrument(level = "info", skip(self, source), fields(data_source_id = %source.id))]
    async fn fetch(&self, _org_id: OrgId, source: &DataSource) -> Result<RowStream> {
        let SourceConfig::CsvUpload {
            path,
            format,
            delimiter,
            ..
        } = &source.config
        else {
            return Err(Error::InvalidInput(format!(
                "file connector cannot read {} sources",
                source.kind()
            )));
        };
        let Some(path) = path else {
            return Err(Error::InvalidInput(
                "csv_upload source has no stored file; upload one instead".to_string(),
            ));
        };
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::Connection(format!("read {path}: {e}")))?;
        Self::parse(bytes, *format, *delimiter)
    }
}

/// Decode as UTF-8, falling back to Windows-1252 for legacy spreadsheet exports.
fn decode_text(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => {
            let bytes = e.into_bytes();
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(&bytes);
            decoded.into_owned()
        }
    }
}

/// Pick the delimiter whose field count is most consistent over the first lines.
fn sniff_delimiter(content: &str) -> u8 {
    let candidates: &[u8] = &[b'\t', b';', b',', b'|'];
    let sample_lines: Vec<&str> = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(10)
        .collect();

    let mut best = b',';
    let mut best_score = 0u64;

    for &delim in candidates {
        let counts: Vec<usize> = sample_lines
            .iter()
            .map(|line| {
                csv::ReaderBuilder::new()
                    .delimiter(delim)
                    .has_headers(false)
                    .flexible(true)
                    .from_reader(line.as_bytes())
                    .records()
                    .next()
                    .and_then(|r| r.ok())
                    .map(|r| r.len())
                    .unwrap_or(1)
            })
            .collect();

        let target = counts.first().copied().unwrap_or(0);
        if target <= 1 {
            continue;
        }
        let consistent = counts.iter().filter(|&&c| c == target).count() as u64;
        let score = consistent * target as u64;
        if score > best_score {
            best_score = score;
            best = delim;
        }
    }
    best
}

fn parse_delimited(bytes: Vec<u8>, delimiter: Option<char>) -> Result<RowStream> {
    let content = decode_text(bytes);
    let delim = match delimiter {
        Some(d) if d.is_ascii() => d as u8,
        Some(d) => {
            return Err(Error::InvalidInput(format!("unsupported csv delimiter {d:?}")));
        }
        None => sniff_delimiter(&content),
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delim)
        .has_headers(false)
        .flexible(true)
        .from_reader(Cursor::new(content.into_bytes()));

    let mut records = reader.records();
    let headers = loop {
        match records.next() {
            None => return Ok(stream_rows(Vec::new())),
            Some(Err(e)) => return Err(Error::Parse(format!("csv header: {e}"))),
            Some(Ok(r)) if r.iter().all(|f| f.trim().is_empty()) => continue,
            Some(Ok(r)) => break header_names(r.iter().map(str::to_string)),
        }
    };
    drop(records);

    let rows = reader.into_records().enumerate().filter_map(move |(i, rec)| match rec {
        Ok(r) => record_to_row(
            &headers,
            r.iter().map(|f| Value::String(f.to_string())).collect(),
        )
        .map(Ok),
        Err(e) => Some(Err(Error::Parse(format!("csv record {}: {e}", i + 1)))),
    });
    Ok(Box::pin(futures_util::stream::iter(rows)))
}

/// Excel's day zero for the 1900 date system.
fn excel_epoch() -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(1899, 12, 30)
}

fn cell_to_value(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::Null,
        Data::String(s) => Value::String(s.clone()),
        Data::Int(n) => Value::from(*n),
        Data::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Data::Bool(b) => Value::Bool(*b),
        Data::DateTime(dt) => {
            let serial = dt.as_f64();
            let date = excel_epoch()
                .and_then(|e| e.checked_add_signed(Duration::days(serial.floor() as i64)));
            match date {
                Some(d) => Value::String(d.format("%Y-%m-%d").to_string()),
                None => Value::Null,
            }
        }
        Data::DateTimeIso(s) | Data::DurationIso(s) => Value::String(s.clone()),
        Data::Error(_) => Value::Null,
    }
}

fn cell_to_header(cell: &Data) -> String {
    match cell_to_value(cell) {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn parse_workbook(bytes: Vec<u8>) -> Result<Vec<RawRow>> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|e| Error::Parse(format!("open workbook: {e}")))?;
    let Some(sheet_name) = workbook.sheet_names().first().cloned() else {
        return Err(Error::Parse("workbook has no worksheets".to_string()));
    };
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| Error::Parse(format!("read worksheet '{sheet_name}': {e}")))?;

    let mut rows = range.rows().skip_while(|r| r.iter().all(|c| matches!(c, Data::Empty)));
    let Some(header_row) = rows.next() else {
        return Ok(Vec::new());
    };
    let headers = header_names(header_row.iter().map(cell_to_header));
    Ok(rows
        .filter_map(|r| record_to_row(&headers, r.iter().map(cell_to_value).collect()))
        .collect())
}
