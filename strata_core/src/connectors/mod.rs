//! Source connectors: uniform, read-only access to raw tabular rows.
//!
//! Connectors yield untyped values only. Type inference and column mapping
//! happen in the transformer.

pub mod credentials;
pub mod file;
pub mod sheets;
pub mod sql;

use crate::config::PipelineConfig;
use crate::ingest::models::{DataSource, SourceKind};
use crate::models::OrgId;
use crate::Result;
use async_trait::async_trait;
use futures_core::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;

pub use credentials::{Credential, CredentialProvider, StaticCredentials};
pub use file::FileConnector;
pub use sheets::SheetsConnector;
pub use sql::SqlConnector;

/// One raw record: column name to untyped scalar, in source column order.
pub type RawRow = serde_json::Map<String, Value>;

/// Lazy, finite sequence of raw rows.
pub type RowStream = Pin<Box<dyn Stream<Item = Result<RawRow>> + Send + 'static>>;

/// Pulls raw rows for one source kind.
///
/// Implementations only read; every call is safe to retry.
#[async_trait]
pub trait Connector: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Fails with `Connection`, `Auth`, or `Parse`.
    async fn fetch(&self, org_id: OrgId, source: &DataSource) -> Result<RowStream>;
}

/// The standard connector set for a configured pipeline.
pub fn default_connectors(
    config: &PipelineConfig,
    credentials: Arc<dyn CredentialProvider>,
) -> Result<Vec<Arc<dyn Connector>>> {
    Ok(vec![
        Arc::new(SqlConnector::new(config.sql_connect_timeout)),
        Arc::new(FileConnector::new()),
        Arc::new(SheetsConnector::new(
            config.sheets_api_base.clone(),
            config.http_timeout,
            credentials,
        )?),
    ])
}

pub(crate) fn stream_rows(rows: Vec<RawRow>) -> RowStream {
    Box::pin(futures_util::stream::iter(rows.into_iter().map(Ok)))
}

/// Column names from a header row: trimmed, blanks become `column_<n>`,
/// repeats get a numeric suffix.
pub(crate) fn header_names<I>(cells: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out: Vec<String> = Vec::new();
    for (i, cell) in cells.into_iter().enumerate() {
        let trimmed = cell.trim().trim_start_matches('\u{feff}').trim();
        let base = if trimmed.is_empty() {
            format!("column_{}", i + 1)
        } else {
            trimmed.to_string()
        };
        let mut name = base.clone();
        let mut n = 2;
        while out.contains(&name) {
            name = format!("{base}_{n}");
            n += 1;
        }
        out.push(name);
    }
    out
}

fn is_blank(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Zip a data row with the header. Short rows pad with null, extra cells get
/// positional names. Returns `None` for rows with no content.
pub(crate) fn record_to_row(headers: &[String], cells: Vec<Value>) -> Option<RawRow> {
    if cells.iter().all(is_blank) {
        return None;
    }
    let width = headers.len().max(cells.len());
    let mut cells = cells.into_iter();
    let mut row = RawRow::new();
    for i in 0..width {
        let name = headers
            .get(i)
            .cloned()
            .unwrap_or_else(|| format!("column_{}", i + 1));
        row.insert(name, cells.next().unwrap_or(Value::Null));
    }
    Some(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn header_names_fill_blanks_and_dedupe() {
        let names = header_names(vec![
            "\u{feff}UF".to_string(),
            " ".to_string(),
            "Valor".to_string(),
            "Valor".to_string(),
        ]);
        assert_eq!(names, vec!["UF", "column_2", "Valor", "Valor_2"]);
    }

    #[test]
    fn record_to_row_pads_and_skips_empty() {
        let headers = vec!["a".to_string(), "b".to_string()];
        let row = record_to_row(&headers, vec![json!("1")]).unwrap();
        assert_eq!(row.get("a"), Some(&json!("1")));
        assert_eq!(row.get("b"), Some(&Value::Null));

        let wide = record_to_row(&headers, vec![json!(1), json!(2), json!(3)]).unwrap();
        assert_eq!(wide.get("column_3"), Some(&json!(3)));

        assert!(record_to_row(&headers, vec![json!(""), Value::Null]).is_none());
    }
}
