//! Staged rows to curated facts.

pub mod coerce;
pub mod mapping;

use crate::connectors::RawRow;
use crate::ingest::models::{DataSource, JobRun, RejectedRow, REJECTED_SAMPLE_LIMIT};
use crate::storage::models::CuratedFact;
use crate::storage::traits::{CuratedStore, StagingStore};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use mapping::{ColumnMapping, CuratedField};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Why a single row was not curated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowRejection {
    /// A required field has no source column.
    MissingColumn(String),
    /// A required field is blank or unparseable.
    Coercion(String),
}

impl RowRejection {
    pub fn code(&self) -> &'static str {
        match self {
            RowRejection::MissingColumn(_) => "SchemaMismatch",
            RowRejection::Coercion(_) => "TypeCoercionError",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            RowRejection::MissingColumn(m) | RowRejection::Coercion(m) => m,
        }
    }
}

/// Counters for one transform pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformReport {
    pub rows_read: u64,
    pub rows_transformed: u64,
    pub rows_rejected: u64,
    pub schema_mismatches: u64,
    pub coercion_failures: u64,
    pub rejected_sample: Vec<RejectedRow>,
}

impl TransformReport {
    fn reject(&mut self, row_index: u64, rejection: RowRejection) {
        self.rows_rejected += 1;
        match rejection {
            RowRejection::MissingColumn(_) => self.schema_mismatches += 1,
            RowRejection::Coercion(_) => self.coercion_failures += 1,
        }
        if self.rejected_sample.len() < REJECTED_SAMPLE_LIMIT {
            self.rejected_sample.push(RejectedRow {
                row_index,
                code: rejection.code().to_string(),
                message: rejection.message().to_string(),
            });
        }
    }

    /// A run with staged rows fails when none of them survived.
    pub fn ensure_survivors(&self) -> Result<()> {
        if self.rows_read == 0 || self.rows_transformed > 0 {
            return Ok(());
        }
        let first = self
            .rejected_sample
            .first()
            .map(|r| r.message.as_str())
            .unwrap_or("");
        if self.coercion_failures == 0 {
            Err(Error::SchemaMismatch(format!(
                "none of {} staged rows has the required columns ({first})",
                self.rows_read
            )))
        } else {
            Err(Error::TypeCoercion(format!(
                "none of {} staged rows could be coerced ({first})",
                self.rows_read
            )))
        }
    }

    /// Copy counters onto the job run record.
    pub fn apply_to(&self, run: &mut JobRun) {
        run.rows_transformed = self.rows_transformed;
        run.rows_rejected = self.rows_rejected;
        run.rejected_sample = self.rejected_sample.clone();
    }
}

/// Reads one run's staged rows, maps and coerces them, and upserts facts in batches.
pub struct Transformer {
    staging: Arc<dyn StagingStore>,
    curated: Arc<dyn CuratedStore>,
    batch_size: usize,
}

impl Transformer {
    pub fn new(
        staging: Arc<dyn StagingStore>,
        curated: Arc<dyn CuratedStore>,
        batch_size: usize,
    ) -> Self {
        Self {
            staging,
            curated,
            batch_size: batch_size.max(1),
        }
    }

    /// Transform every staged row of `run`. Row-level problems are counted in
    /// the report; only storage failures return `Err`. Re-running over the same
    /// staged rows upserts the same facts.
    #[tracing::instrument(level = "info", skip(self, source, run), fields(job_run_id = %run.id, data_source_id = %source.id))]
    pub async fn transform(&self, source: &DataSource, run: &JobRun) -> Result<TransformReport> {
        let org_id = run.organization_id;
        crate::models::ensure_same_org(org_id, source.organization_id, "data source")?;

        let curated_at = Utc::now();
        let mut report = TransformReport::default();
        let mut batch: Vec<CuratedFact> = Vec::with_capacity(self.batch_size);
        let mut cached: Option<(Vec<String>, ColumnMapping)> = None;

        let mut rows = self.staging.read_by_run(org_id, run.id);
        while let Some(staged) = rows.next().await {
            let staged = staged?;
            let row_index = report.rows_read;
            report.rows_read += 1;

            let headers: Vec<&str> = staged.raw_payload.keys().map(String::as_str).collect();
            let reuse = matches!(&cached, Some((h, _)) if h.iter().map(String::as_str).eq(headers.iter().copied()));
            if !reuse {
                let mapping = ColumnMapping::resolve(source.kind(), headers.iter().copied());
                cached = Some((headers.iter().map(|h| h.to_string()).collect(), mapping));
            }
            let Some((_, mapping)) = &cached else {
                continue;
            };

            match curate_row(source, run, mapping, &staged.raw_payload, curated_at) {
                Ok(fact) => {
                    report.rows_transformed += 1;
                    batch.push(fact);
                }
                Err(rejection) => {
                    tracing::debug!(row_index, code = rejection.code(), reason = rejection.message(), "row rejected");
                    report.reject(row_index, rejection);
                }
            }

            if batch.len() >= self.batch_size {
                self.curated.upsert_facts(org_id, &batch).await?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.curated.upsert_facts(org_id, &batch).await?;
        }

        tracing::info!(
            rows_read = report.rows_read,
            rows_transformed = report.rows_transformed,
            rows_rejected = report.rows_rejected,
            "transform finished"
        );
        Ok(report)
    }
}

fn field_value<'a>(mapping: &ColumnMapping, row: &'a RawRow, field: CuratedField) -> Option<&'a Value> {
    mapping.column(field).and_then(|c| row.get(c))
}

fn text(mapping: &ColumnMapping, row: &RawRow, field: CuratedField) -> Option<String> {
    field_value(mapping, row, field).and_then(coerce::to_text)
}

/// Optional measures degrade to null when unparseable.
fn optional_number(mapping: &ColumnMapping, row: &RawRow, field: CuratedField) -> Option<f64> {
    field_value(mapping, row, field).and_then(|v| coerce::to_number(v).ok().flatten())
}

fn required<T>(
    mapping: &ColumnMapping,
    row: &RawRow,
    field: CuratedField,
    coerce: impl Fn(&Value) -> std::result::Result<Option<T>, String>,
) -> std::result::Result<T, RowRejection> {
    let Some(column) = mapping.column(field) else {
        return Err(RowRejection::MissingColumn(format!(
            "no column maps to required field '{}'",
            field.name()
        )));
    };
    let value = row.get(column).unwrap_or(&Value::Null);
    match coerce(value) {
        Ok(Some(v)) => Ok(v),
        Ok(None) => Err(RowRejection::Coercion(format!(
            "required field '{}' (column '{column}') is empty",
            field.name()
        ))),
        Err(reason) => Err(RowRejection::Coercion(format!(
            "required field '{}' (column '{column}'): {reason}",
            field.name()
        ))),
    }
}

/// Stable key for rows without a record identifier.
fn payload_digest(row: &RawRow) -> String {
    let mut hasher = Sha256::new();
    for (k, v) in row {
        hasher.update(k.as_bytes());
        hasher.update([0u8]);
        hasher.update(v.to_string().as_bytes());
        hasher.update([0u8]);
    }
    format!("row:{}", hex::encode(hasher.finalize()))
}

/// Map and coerce one raw row into a fact.
pub fn curate_row(
    source: &DataSource,
    run: &JobRun,
    mapping: &ColumnMapping,
    row: &RawRow,
    curated_at: DateTime<Utc>,
) -> std::result::Result<CuratedFact, RowRejection> {
    let period = required(mapping, row, CuratedField::Period, coerce::to_date)?;
    let amount = required(mapping, row, CuratedField::Amount, coerce::to_number)?;

    let region = text(mapping, row, CuratedField::Region).map(|r| r.to_uppercase());
    let record_key =
        text(mapping, row, CuratedField::RecordKey).unwrap_or_else(|| payload_digest(row));
    let creditor_code = source
        .config
        .creditor_code()
        .map(str::to_string)
        .or_else(|| text(mapping, row, CuratedField::CreditorCode));

    Ok(CuratedFact {
        organization_id: run.organization_id,
        data_source_id: source.id,
        natural_key: CuratedFact::build_natural_key(
            source.id,
            &record_key,
            period,
            region.as_deref(),
        ),
        record_key,
        period,
        region,
        status: text(mapping, row, CuratedField::Status),
        maturity_band: text(mapping, row, CuratedField::MaturityBand),
        creditor_code,
        debtor: text(mapping, row, CuratedField::Debtor),
        document: text(mapping, row, CuratedField::Document),
        due_date: field_value(mapping, row, CuratedField::DueDate)
            .and_then(|v| coerce::to_date(v).ok().flatten()),
        amount,
        recovered_amount: optional_number(mapping, row, CuratedField::RecoveredAmount),
        balance: optional_number(mapping, row, CuratedField::Balance),
        fee_amount: optional_number(mapping, row, CuratedField::FeeAmount),
        contract_fee: optional_number(mapping, row, CuratedField::ContractFee),
        days_overdue: field_value(mapping, row, CuratedField::DaysOverdue)
            .and_then(|v| coerce::to_integer(v).ok().flatten()),
        source_job_run_id: run.id,
        curated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::models::{FileFormat, JobTrigger, SourceConfig};
    use crate::models::OrgId;
    use chrono::NaiveDate;
    use serde_json::json;

    fn upload_source(creditor_code: Option<&str>) -> DataSource {
        DataSource::new(
            OrgId::new(),
            "upload",
            SourceConfig::CsvUpload {
                path: None,
                format: FileFormat::Csv,
                delimiter: None,
                creditor_code: creditor_code.map(str::to_string),
            },
            false,
            None,
            None,
        )
        .unwrap()
    }

    fn raw(v: serde_json::Value) -> RawRow {
        v.as_object().cloned().unwrap()
    }

    fn curate(source: &DataSource, row: &RawRow) -> std::result::Result<CuratedFact, RowRejection> {
        let run = JobRun::new_pending(source, JobTrigger::Upload, Utc::now());
        let mapping = ColumnMapping::resolve(source.kind(), row.keys().map(String::as_str));
        curate_row(source, &run, &mapping, row, Utc::now())
    }

    #[test]
    fn curates_a_typical_spreadsheet_row() {
        let source = upload_source(None);
        let row = raw(json!({
            "Processo": "0001",
            "UF": "sp",
            "Data Cadastro": "15/01/2024",
            "Vl Título": "1.500,25",
            "Vl Total Repasse": "abc",
            "Situação": "Ativo",
            "Cód. Cliente": "C9"
        }));
        let fact = curate(&source, &row).unwrap();
        assert_eq!(fact.period, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        assert_eq!(fact.amount, 1500.25);
        assert_eq!(fact.region.as_deref(), Some("SP"));
        assert_eq!(fact.status.as_deref(), Some("Ativo"));
        assert_eq!(fact.creditor_code.as_deref(), Some("C9"));
        assert_eq!(fact.recovered_amount, None);
        assert_eq!(
            fact.natural_key,
            format!("{}|0001|2024-01-15|SP", source.id)
        );
    }

    #[test]
    fn source_creditor_code_overrides_row() {
        let source = upload_source(Some("CFG"));
        let row = raw(json!({"dt_cadastro": "2024-02-01", "valor": 3, "cod_cliente": "ROW"}));
        assert_eq!(curate(&source, &row).unwrap().creditor_code.as_deref(), Some("CFG"));
    }

    #[test]
    fn keyless_rows_get_a_stable_digest() {
        let source = upload_source(None);
        let row = raw(json!({"dt_cadastro": "2024-02-01", "valor": 3}));
        let a = curate(&source, &row).unwrap();
        let b = curate(&source, &row).unwrap();
        assert!(a.record_key.starts_with("row:"));
        assert_eq!(a.natural_key, b.natural_key);
    }

    #[test]
    fn required_fields_reject_the_row() {
        let source = upload_source(None);
        let missing = raw(json!({"uf": "SP", "valor": 1}));
        assert!(matches!(curate(&source, &missing), Err(RowRejection::MissingColumn(_))));

        let bad_amount = raw(json!({"dt_cadastro": "2024-02-01", "valor": "n/d"}));
        assert!(matches!(curate(&source, &bad_amount), Err(RowRejection::Coercion(_))));

        let blank_date = raw(json!({"dt_cadastro": "", "valor": 1}));
        assert!(matches!(curate(&source, &blank_date), Err(RowRejection::Coercion(_))));
    }

    #[test]
    fn report_verdicts() {
        let mut report = TransformReport {
            rows_read: 2,
            ..TransformReport::default()
        };
        report.reject(0, RowRejection::MissingColumn("no period".into()));
        report.reject(1, RowRejection::MissingColumn("no period".into()));
        assert!(matches!(report.ensure_survivors(), Err(Error::SchemaMismatch(_))));

        report.reject(2, RowRejection::Coercion("bad".into()));
        assert!(matches!(report.ensure_survivors(), Err(Error::TypeCoercion(_))));

        assert!(TransformReport::default().ensure_survivors().is_ok());
    }
}
