use crate::connectors::{
    header_names, record_to_row, stream_rows, Connector, CredentialProvider, RawRow, RowStream,
};
use crate::ingest::models::{DataSource, SourceConfig, SourceKind};
use crate::models::OrgId;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Reads a `(spreadsheet_id, range)` through the cloud spreadsheet values API
/// using the organization's stored credential.
pub struct SheetsConnector {
    http: reqwest::Client,
    api_base: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl SheetsConnector {
    #[tracing::instrument(level = "debug", skip(credentials))]
    pub fn new(
        api_base: impl Into<String> + std::fmt::Debug,
        timeout: Duration,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::backend("build sheets http client", e))?;
        Ok(Self {
            http,
            api_base: api_base.into(),
            credentials,
        })
    }

    fn values_url(&self, spreadsheet_id: &str, range: &str) -> Result<Url> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| Error::InvalidInput(format!("invalid sheets api base: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| Error::InvalidInput("sheets api base cannot be a base url".to_string()))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", spreadsheet_id, "values", range]);
        url.query_pairs_mut()
            .append_pair("valueRenderOption", "UNFORMATTED_VALUE")
            .append_pair("dateTimeRenderOption", "FORMATTED_STRING");
        Ok(url)
    }
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

fn cell_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Turn a values API response body into rows. The first row is the header.
pub fn parse_value_range(body: &[u8]) -> Result<Vec<RawRow>> {
    let range: ValueRange = serde_json::from_slice(body)
        .map_err(|e| Error::Parse(format!("spreadsheet response: {e}")))?;
    let mut rows = range.values.into_iter();
    let Some(header) = rows.next() else {
        return Ok(Vec::new());
    };
    let headers = header_names(header.iter().map(cell_text));
    Ok(rows.filter_map(|r| record_to_row(&headers, r)).collect())
}

#[async_trait]
impl Connector for SheetsConnector {
    fn kind(&self) -> SourceKind {
        SourceKind::GoogleSheets
    }

    #[tracing::instrument(level = "info", skip(self, source), fields(data_source_id = %source.id))]
    async fn fetch(&self, org_id: OrgId, source: &DataSource) -> Result<RowStream> {
        let SourceConfig::GoogleSheets {
            spreadsheet_id,
            range,
            ..
        } = &source.config
        else {
            return Err(Error::InvalidInput(format!(
                "sheets connector cannot read {} sources",
                source.kind()
            )));
        };

        let credential = self
            .credentials
            .get_credential(org_id, SourceKind::GoogleSheets)
            .await?
            .ok_or_else(|| {
                Error::Auth(format!(
                    "no spreadsheet credential stored for organization {org_id}"
                ))
            })?;

        let url = self.values_url(spreadsheet_id, range)?;
        let resp = self
            .http
            .get(url)
            .bearer_auth(&credential.access_token)
            .send()
            .await
            .map_err(|e| Error::Connection(format!("spreadsheet api: {e}")))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::Auth(format!(
                "spreadsheet api rejected credential ({status})"
            )));
        }
        if !status.is_success() {
            return Err(Error::Connection(format!("spreadsheet api returned {status}")));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::Connection(format!("read spreadsheet response: {e}")))?;
        let rows = parse_value_range(&body)?;
        tracing::debug!(rows = rows.len(), "spreadsheet range fetched");
        Ok(stream_rows(rows))
    }
}
