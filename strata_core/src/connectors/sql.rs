use crate::connectors::{Connector, RawRow, RowStream};
use crate::ingest::models::{DataSource, SourceConfig, SourceKind};
use crate::models::OrgId;
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use regex::Regex;
use serde_json::Value;
use sqlx::any::AnyRow;
use sqlx::{Column, Connection, Row};
use std::sync::Once;
use std::time::Duration;

static INSTALL_DRIVERS: Once = Once::new();

const LEADING_KEYWORD: &str = r"^(select|with)\b";
const FORBIDDEN_KEYWORD: &str = r"\b(insert|update|delete|drop|alter|create|truncate|grant|revoke|merge|attach|detach|pragma|vacuum|copy|call|exec|execute)\b";

fn keyword_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| Error::BackendMessage(format!("sql keyword regex error: {e}")))
}

/// Check that a stored source query is a single read-only statement.
///
/// Strips a leading BOM and one trailing `;`; returns the statement to execute.
pub fn validate_read_only(query: &str) -> Result<String> {
    let q = query.trim().trim_start_matches('\u{feff}').trim();
    let q = q.strip_suffix(';').unwrap_or(q).trim_end();
    if q.is_empty() {
        return Err(Error::InvalidInput("sql query is empty".to_string()));
    }
    let lower = q.to_lowercase();
    if !keyword_regex(LEADING_KEYWORD)?.is_match(&lower) {
        return Err(Error::InvalidInput(
            "sql query must start with SELECT or WITH".to_string(),
        ));
    }
    if q.contains(';') {
        return Err(Error::InvalidInput(
            "sql query must be a single statement".to_string(),
        ));
    }
    if let Some(m) = keyword_regex(FORBIDDEN_KEYWORD)?.find(&lower) {
        return Err(Error::InvalidInput(format!(
            "sql query contains forbidden keyword '{}'",
            m.as_str()
        )));
    }
    Ok(q.to_string())
}

/// Runs a source's stored read-only query against its own database.
///
/// Supports `sqlite:`, `postgres:` and `mysql:` URLs. Rows are streamed from
/// the server; column values decode as integer, float, text, or bool.
pub struct SqlConnector {
    connect_timeout: Duration,
}

impl SqlConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);
        Self { connect_timeout }
    }
}

fn decode_column(row: &AnyRow, idx: usize) -> Result<Value> {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return Ok(v.map(Value::from).unwrap_or(Value::Null));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return Ok(v
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null));
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return Ok(v.map(Value::String).unwrap_or(Value::Null));
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return Ok(v.map(Value::Bool).unwrap_or(Value::Null));
    }
    let name = row.columns().get(idx).map(|c| c.name()).unwrap_or("?");
    Err(Error::Parse(format!(
        "column '{name}' has an unsupported type; cast it to text in the source query"
    )))
}

/// Rows the driver cannot decode are a data problem, not an unreachable source.
fn query_error(e: sqlx::Error) -> Error {
    match e {
        sqlx::Error::Decode(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::AnyDriverError(_)
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. } => Error::Parse(format!(
            "source rows could not be decoded: {e}; cast unsupported columns to text in the source query"
        )),
        other => Error::Connection(format!("source query failed: {other}")),
    }
}

fn any_row_to_raw(row: &AnyRow) -> Result<RawRow> {
    let mut out = RawRow::new();
    for (idx, col) in row.columns().iter().enumerate() {
        out.insert(col.name().to_string(), decode_column(row, idx)?);
    }
    Ok(out)
}

#[async_trait]
impl Connector for SqlConnector {
    fn kind(&self) -> SourceKind {
        SourceKind::Sql
    }

    #[tracing::instrument(level = "info", skip(self, source), fields(data_source_id = %source.id))]
    async fn fetch(&self, org_id: OrgId, source: &DataSource) -> Result<RowStream> {
        let SourceConfig::Sql {
            connection_url,
            query,
            ..
        } = &source.config
        else {
            return Err(Error::InvalidInput(format!(
                "sql connector cannot read {} sources",
                source.kind()
            )));
        };
        let statement = validate_read_only(query)?;

        let conn = tokio::time::timeout(
            self.connect_timeout,
            sqlx::AnyConnection::connect(connection_url),
        )
        .await
        .map_err(|_| Error::Connection("timed out connecting to source database".to_string()))?
        .map_err(|e| Error::Connection(format!("connect to source database: {e}")))?;

        tracing::debug!(%org_id, "source database connected");

        Ok(Box::pin(async_stream::stream! {
            let mut conn = conn;
            {
                let mut rows = sqlx::query(&statement).fetch(&mut conn);
                while let Some(next) = rows.next().await {
                    match next {
                        Ok(row) => yield any_row_to_raw(&row),
                        Err(e) => {
                            yield Err(query_error(e));
                            break;
                        }
                    }
                }
            }
            let _ = conn.close().await;
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_selects() {
        assert_eq!(
            validate_read_only("\u{feff}SELECT * FROM titulos;").unwrap(),
            "SELECT * FROM titulos"
        );
        assert!(validate_read_only("with t as (select 1) select * from t").is_ok());
        assert!(validate_read_only("select updated_at, deleted_flag from t").is_ok());
        assert!(validate_read_only("select replace(nome, 'a', 'b') from t").is_ok());
    }

    #[test]
    fn decode_failures_are_parse_errors() {
        let decode = query_error(sqlx::Error::Decode("unsupported type DATE".into()));
        assert_eq!(decode.code(), "ParseError");
        assert!(!decode.is_retryable());

        let column = query_error(sqlx::Error::ColumnDecode {
            index: "\"vl_titulo\"".to_string(),
            source: "unsupported type NUMERIC".into(),
        });
        assert!(matches!(column, Error::Parse(_)));

        let any = query_error(sqlx::Error::AnyDriverError("unsupported type TIMESTAMP".into()));
        assert!(matches!(any, Error::Parse(_)));

        let missing = query_error(sqlx::Error::TypeNotFound {
            type_name: "money".to_string(),
        });
        assert!(matches!(missing, Error::Parse(_)));
    }

    #[test]
    fn transport_failures_stay_retryable() {
        let io = query_error(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        )));
        assert!(io.is_retryable());
        assert!(query_error(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(matches!(
            query_error(sqlx::Error::Protocol("unexpected message".to_string())),
            Error::Connection(_)
        ));
    }

    #[test]
    fn rejects_writes_and_batches() {
        assert!(validate_read_only("").is_err());
        assert!(validate_read_only("delete from titulos").is_err());
        assert!(validate_read_only("select 1; drop table titulos").is_err());
        assert!(validate_read_only("select * from t where x in (delete from y)").is_err());
        assert!(validate_read_only("selective from t").is_err());
    }
}
