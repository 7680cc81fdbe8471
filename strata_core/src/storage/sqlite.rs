//! SQLite-backed pipeline storage.
//!
//! Persists organizations, data sources, job runs, staged rows and curated
//! facts in a single WAL-mode SQLite file. Every table carries
//! `organization_id` and every tenant-facing statement filters on it.
//!
//! Usage:
//! ```ignore
//! let db = SqlitePipelineDb::new("/path/to/strata.db").await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

use crate::connectors::RawRow;
use crate::error::{Error as CoreError, Result as CoreResult};
use crate::ingest::models::{
    DataSource, JobRun, JobRunQuery, JobRunStatus, JobTrigger, RejectedRow, SourceConfig,
};
use crate::models::{DataSourceId, JobRunId, OrgId, Organization};
use crate::storage::models::{
    AggregateQuery, AggregateShape, CuratedFact, FactQuery, IndicatorRow, ListQuery, StagedRow,
};
use crate::storage::traits::{
    ensure_facts_org, CuratedStore, SourceCatalog, StagedRowStream, StagingStore,
};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

/// Rows fetched per page when streaming a run out of staging.
const STAGING_PAGE_SIZE: i64 = 500;

/// Durable pipeline storage backed by one SQLite file (WAL mode).
#[derive(Clone)]
pub struct SqlitePipelineDb {
    pool: SqlitePool,
}

impl SqlitePipelineDb {
    /// Create (or open) the database at `path`, creating parent directories
    /// and applying the schema.
    pub async fn new(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| CoreError::backend("sqlite_pipeline_db", e))?;
            }
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))
            .map_err(|e| CoreError::backend("sqlite_pipeline_db", e))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|e| CoreError::backend("sqlite_pipeline_db", e))?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| CoreError::backend("sqlite_pipeline_db_migration", e))?;

        Ok(Self { pool })
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS organizations (
    id TEXT PRIMARY KEY,
    slug TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS data_sources (
    id TEXT PRIMARY KEY,
    organization_id TEXT NOT NULL REFERENCES organizations(id),
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    config_json TEXT NOT NULL,
    is_recurring INTEGER NOT NULL,
    interval_minutes INTEGER,
    enabled INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS data_sources_org_created
    ON data_sources(organization_id, created_at);
CREATE INDEX IF NOT EXISTS data_sources_recurring
    ON data_sources(is_recurring, enabled, created_at);

CREATE TABLE IF NOT EXISTS job_runs (
    id TEXT PRIMARY KEY,
    data_source_id TEXT NOT NULL REFERENCES data_sources(id),
    organization_id TEXT NOT NULL,
    trigger TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    rows_staged INTEGER NOT NULL DEFAULT 0,
    rows_transformed INTEGER NOT NULL DEFAULT 0,
    rows_rejected INTEGER NOT NULL DEFAULT 0,
    rejected_sample_json TEXT NOT NULL DEFAULT '[]',
    error_detail TEXT
);
-- At most one pending/running run per data source.
CREATE UNIQUE INDEX IF NOT EXISTS job_runs_one_active
    ON job_runs(data_source_id) WHERE status IN ('pending', 'running');
CREATE INDEX IF NOT EXISTS job_runs_org_created
    ON job_runs(organization_id, created_at);
CREATE INDEX IF NOT EXISTS job_runs_source_created
    ON job_runs(data_source_id, created_at);

CREATE TABLE IF NOT EXISTS staged_rows (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    job_run_id TEXT NOT NULL,
    organization_id TEXT NOT NULL,
    raw_payload TEXT NOT NULL,
    ingested_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS staged_rows_org_run
    ON staged_rows(organization_id, job_run_id, seq);
CREATE INDEX IF NOT EXISTS staged_rows_ingested
    ON staged_rows(ingested_at);

CREATE TABLE IF NOT EXISTS curated_facts (
    organization_id TEXT NOT NULL,
    natural_key TEXT NOT NULL,
    data_source_id TEXT NOT NULL,
    record_key TEXT NOT NULL,
    period TEXT NOT NULL,
    region TEXT,
    status TEXT,
    maturity_band TEXT,
    creditor_code TEXT,
    debtor TEXT,
    document TEXT,
    due_date TEXT,
    amount REAL NOT NULL,
    recovered_amount REAL,
    balance REAL,
    fee_amount REAL,
    contract_fee REAL,
    days_overdue INTEGER,
    source_job_run_id TEXT NOT NULL,
    curated_at TEXT NOT NULL,
    PRIMARY KEY (organization_id, natural_key)
);
CREATE INDEX IF NOT EXISTS curated_facts_org_period
    ON curated_facts(organization_id, period);
CREATE INDEX IF NOT EXISTS curated_facts_org_region
    ON curated_facts(organization_id, region);
"#;

// Fixed indicator statements. ?1 org, ?2 from, ?3 to, ?4 region, ?5 status, ?6 creditor_code.
const AMOUNT_BY_MONTH_SQL: &str = r#"
SELECT strftime('%Y-%m', period) AS bucket, TOTAL(amount) AS total, COUNT(*) AS fact_count
FROM curated_facts
WHERE organization_id = ?1
  AND (?2 IS NULL OR period >= ?2)
  AND (?3 IS NULL OR period <= ?3)
  AND (?4 IS NULL OR region = ?4)
  AND (?5 IS NULL OR status = ?5)
  AND (?6 IS NULL OR creditor_code = ?6)
GROUP BY bucket
ORDER BY bucket
"#;

const AMOUNT_BY_REGION_SQL: &str = r#"
SELECT COALESCE(region, 'unspecified') AS bucket, TOTAL(amount) AS total, COUNT(*) AS fact_count
FROM curated_facts
WHERE organization_id = ?1
  AND (?2 IS NULL OR period >= ?2)
  AND (?3 IS NULL OR period <= ?3)
  AND (?4 IS NULL OR region = ?4)
  AND (?5 IS NULL OR status = ?5)
  AND (?6 IS NULL OR creditor_code = ?6)
GROUP BY bucket
ORDER BY total DESC, bucket
"#;

// ?7 is the reference date. Band bounds mirror `MATURITY_BANDS`.
macro_rules! maturity_band_sql {
    ($value:literal) => {
        concat!(
            r#"
WITH banded AS (
  SELECT
    CASE
      WHEN due_date IS NULL THEN 'unspecified'
      WHEN julianday(?7) - julianday(due_date) <= 30 THEN '0-30'
      WHEN julianday(?7) - julianday(due_date) <= 60 THEN '31-60'
      WHEN julianday(?7) - julianday(due_date) <= 90 THEN '61-90'
      WHEN julianday(?7) - julianday(due_date) <= 180 THEN '91-180'
      WHEN julianday(?7) - julianday(due_date) <= 360 THEN '181-360'
      WHEN julianday(?7) - julianday(due_date) <= 720 THEN '361-720'
      ELSE '720+'
    END AS bucket,
    "#,
            $value,
            r#" AS value
  FROM curated_facts
  WHERE organization_id = ?1
    AND (?2 IS NULL OR period >= ?2)
    AND (?3 IS NULL OR period <= ?3)
    AND (?4 IS NULL OR region = ?4)
    AND (?5 IS NULL OR status = ?5)
    AND (?6 IS NULL OR creditor_code = ?6)
)
SELECT bucket, TOTAL(value) AS total, COUNT(*) AS fact_count
FROM banded
GROUP BY bucket
ORDER BY CASE bucket
  WHEN '0-30' THEN 1
  WHEN '31-60' THEN 2
  WHEN '61-90' THEN 3
  WHEN '91-180' THEN 4
  WHEN '181-360' THEN 5
  WHEN '361-720' THEN 6
  WHEN '720+' THEN 7
  ELSE 8
END
"#
        )
    };
}

const AMOUNT_BY_MATURITY_BAND_SQL: &str = maturity_band_sql!("amount");
const RECOVERED_BY_MATURITY_BAND_SQL: &str = maturity_band_sql!("recovered_amount");

fn aggregate_sql(shape: AggregateShape) -> &'static str {
    match shape {
        AggregateShape::AmountByMonth => AMOUNT_BY_MONTH_SQL,
        AggregateShape::AmountByRegion => AMOUNT_BY_REGION_SQL,
        AggregateShape::AmountByMaturityBand => AMOUNT_BY_MATURITY_BAND_SQL,
        AggregateShape::RecoveredByMaturityBand => RECOVERED_BY_MATURITY_BAND_SQL,
    }
}

// ── helpers ───────────────────────────────────────────────────

fn db_err(e: sqlx::Error) -> CoreError {
    CoreError::backend("sqlite_pipeline_db", e)
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|d| d.is_unique_violation())
        .unwrap_or(false)
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn fmt_dt(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn fmt_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn corrupt(what: &str, value: &str) -> CoreError {
    CoreError::BackendMessage(format!("corrupt {what} in sqlite_pipeline_db: {value}"))
}

fn parse_dt(s: &str) -> CoreResult<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>().map_err(|_| corrupt("timestamp", s))
}

fn parse_date(s: &str) -> CoreResult<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| corrupt("date", s))
}

fn parse_id<T: FromStr>(s: &str) -> CoreResult<T> {
    s.parse::<T>().map_err(|_| corrupt("id", s))
}

fn row_to_org(r: &sqlx::sqlite::SqliteRow) -> CoreResult<Organization> {
    let id: String = r.get("id");
    let created_at: String = r.get("created_at");
    Ok(Organization {
        id: parse_id(&id)?,
        slug: r.get("slug"),
        name: r.get("name"),
        created_at: parse_dt(&created_at)?,
    })
}

fn row_to_data_source(r: &sqlx::sqlite::SqliteRow) -> CoreResult<DataSource> {
    let id: String = r.get("id");
    let org_id: String = r.get("organization_id");
    let config_json: String = r.get("config_json");
    let is_recurring: i64 = r.get("is_recurring");
    let interval_minutes: Option<i64> = r.get("interval_minutes");
    let enabled: i64 = r.get("enabled");
    let created_at: String = r.get("created_at");
    let updated_at: String = r.get("updated_at");

    let config: SourceConfig =
        serde_json::from_str(&config_json).map_err(|e| CoreError::backend("decode config_json", e))?;

    Ok(DataSource {
        id: parse_id(&id)?,
        organization_id: parse_id(&org_id)?,
        name: r.get("name"),
        config,
        is_recurring: is_recurring != 0,
        interval_minutes: interval_minutes.and_then(|m| u32::try_from(m).ok()),
        enabled: enabled != 0,
        created_at: parse_dt(&created_at)?,
        updated_at: parse_dt(&updated_at)?,
    })
}

fn row_to_job_run(r: &sqlx::sqlite::SqliteRow) -> CoreResult<JobRun> {
    let id: String = r.get("id");
    let data_source_id: String = r.get("data_source_id");
    let org_id: String = r.get("organization_id");
    let trigger: String = r.get("trigger");
    let status: String = r.get("status");
    let created_at: String = r.get("created_at");
    let started_at: Option<String> = r.get("started_at");
    let finished_at: Option<String> = r.get("finished_at");
    let rows_staged: i64 = r.get("rows_staged");
    let rows_transformed: i64 = r.get("rows_transformed");
    let rows_rejected: i64 = r.get("rows_rejected");
    let rejected_json: String = r.get("rejected_sample_json");

    let rejected_sample: Vec<RejectedRow> = serde_json::from_str(&rejected_json)
        .map_err(|e| CoreError::backend("decode rejected_sample_json", e))?;

    Ok(JobRun {
        id: parse_id(&id)?,
        data_source_id: parse_id(&data_source_id)?,
        organization_id: parse_id(&org_id)?,
        trigger: JobTrigger::parse_str(&trigger).ok_or_else(|| corrupt("trigger", &trigger))?,
        status: JobRunStatus::parse_str(&status).ok_or_else(|| corrupt("status", &status))?,
        created_at: parse_dt(&created_at)?,
        started_at: started_at.as_deref().map(parse_dt).transpose()?,
        finished_at: finished_at.as_deref().map(parse_dt).transpose()?,
        rows_staged: rows_staged.max(0) as u64,
        rows_transformed: rows_transformed.max(0) as u64,
        rows_rejected: rows_rejected.max(0) as u64,
        rejected_sample,
        error_detail: r.get("error_detail"),
    })
}

fn row_to_staged(r: &sqlx::sqlite::SqliteRow) -> CoreResult<StagedRow> {
    let job_run_id: String = r.get("job_run_id");
    let org_id: String = r.get("organization_id");
    let payload: String = r.get("raw_payload");
    let ingested_at: String = r.get("ingested_at");
    Ok(StagedRow {
        seq: r.get("seq"),
        job_run_id: parse_id(&job_run_id)?,
        organization_id: parse_id(&org_id)?,
        raw_payload: serde_json::from_str(&payload)
            .map_err(|e| CoreError::backend("decode raw_payload", e))?,
        ingested_at: parse_dt(&ingested_at)?,
    })
}

fn row_to_fact(r: &sqlx::sqlite::SqliteRow) -> CoreResult<CuratedFact> {
    let org_id: String = r.get("organization_id");
    let data_source_id: String = r.get("data_source_id");
    let period: String = r.get("period");
    let due_date: Option<String> = r.get("due_date");
    let job_run_id: String = r.get("source_job_run_id");
    let curated_at: String = r.get("curated_at");
    Ok(CuratedFact {
        organization_id: parse_id(&org_id)?,
        data_source_id: parse_id(&data_source_id)?,
        natural_key: r.get("natural_key"),
        record_key: r.get("record_key"),
        period: parse_date(&period)?,
        region: r.get("region"),
        status: r.get("status"),
        maturity_band: r.get("maturity_band"),
        creditor_code: r.get("creditor_code"),
        debtor: r.get("debtor"),
        document: r.get("document"),
        due_date: due_date.as_deref().map(parse_date).transpose()?,
        amount: r.get("amount"),
        recovered_amount: r.get("recovered_amount"),
        balance: r.get("balance"),
        fee_amount: r.get("fee_amount"),
        contract_fee: r.get("contract_fee"),
        days_overdue: r.get("days_overdue"),
        source_job_run_id: parse_id(&job_run_id)?,
        curated_at: parse_dt(&curated_at)?,
    })
}

const JOB_RUN_COLUMNS: &str = "id, data_source_id, organization_id, trigger, status, created_at, \
     started_at, finished_at, rows_staged, rows_transformed, rows_rejected, \
     rejected_sample_json, error_detail";

const DATA_SOURCE_COLUMNS: &str = "id, organization_id, name, kind, config_json, is_recurring, \
     interval_minutes, enabled, created_at, updated_at";

const FACT_COLUMNS: &str = "organization_id, natural_key, data_source_id, record_key, period, \
     region, status, maturity_band, creditor_code, debtor, document, due_date, amount, \
     recovered_amount, balance, fee_amount, contract_fee, days_overdue, source_job_run_id, \
     curated_at";

// ── SourceCatalog impl ────────────────────────────────────────

#[async_trait]
impl SourceCatalog for SqlitePipelineDb {
    async fn upsert_organization(&self, org: &Organization) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO organizations (id, slug, name, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET slug = excluded.slug, name = excluded.name",
        )
        .bind(org.id.to_string())
        .bind(&org.slug)
        .bind(&org.name)
        .bind(fmt_dt(org.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                CoreError::Conflict(format!("slug '{}' already taken", org.slug))
            } else {
                db_err(e)
            }
        })?;
        Ok(())
    }

    async fn get_organization(&self, org_id: OrgId) -> CoreResult<Option<Organization>> {
        let row = sqlx::query("SELECT id, slug, name, created_at FROM organizations WHERE id = ?1")
            .bind(org_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_org).transpose()
    }

    async fn get_organization_by_slug(&self, slug: &str) -> CoreResult<Option<Organization>> {
        let row =
            sqlx::query("SELECT id, slug, name, created_at FROM organizations WHERE slug = ?1")
                .bind(slug)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        row.as_ref().map(row_to_org).transpose()
    }

    async fn upsert_data_source(&self, source: &DataSource) -> CoreResult<()> {
        let config_json = serde_json::to_string(&source.config)
            .map_err(|e| CoreError::backend("serialize source config", e))?;

        let res = sqlx::query(
            "INSERT INTO data_sources (id, organization_id, name, kind, config_json, is_recurring,
             interval_minutes, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
               name = excluded.name,
               kind = excluded.kind,
               config_json = excluded.config_json,
               is_recurring = excluded.is_recurring,
               interval_minutes = excluded.interval_minutes,
               enabled = excluded.enabled,
               updated_at = excluded.updated_at
             WHERE data_sources.organization_id = excluded.organization_id",
        )
        .bind(source.id.to_string())
        .bind(source.organization_id.to_string())
        .bind(&source.name)
        .bind(source.kind().as_str())
        .bind(&config_json)
        .bind(source.is_recurring as i64)
        .bind(source.interval_minutes.map(i64::from))
        .bind(source.enabled as i64)
        .bind(fmt_dt(source.created_at))
        .bind(fmt_dt(source.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if res.rows_affected() == 0 {
            return Err(CoreError::Unauthorized(
                "data source belongs to a different organization".to_string(),
            ));
        }
        Ok(())
    }

    async fn get_data_source(
        &self,
        org_id: OrgId,
        data_source_id: DataSourceId,
    ) -> CoreResult<Option<DataSource>> {
        let sql = format!(
            "SELECT {DATA_SOURCE_COLUMNS} FROM data_sources WHERE organization_id = ?1 AND id = ?2"
        );
        let row = sqlx::query(&sql)
            .bind(org_id.to_string())
            .bind(data_source_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_data_source).transpose()
    }

    async fn list_data_sources(
        &self,
        org_id: OrgId,
        query: ListQuery,
    ) -> CoreResult<Vec<DataSource>> {
        let sql = format!(
            "SELECT {DATA_SOURCE_COLUMNS} FROM data_sources WHERE organization_id = ?1
             ORDER BY created_at, id LIMIT ?2 OFFSET ?3"
        );
        let rows = sqlx::query(&sql)
            .bind(org_id.to_string())
            .bind(query.limit as i64)
            .bind(query.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_data_source).collect()
    }

    async fn list_recurring_sources(&self, query: ListQuery) -> CoreResult<Vec<DataSource>> {
        let sql = format!(
            "SELECT {DATA_SOURCE_COLUMNS} FROM data_sources WHERE is_recurring = 1 AND enabled = 1
             ORDER BY created_at, id LIMIT ?1 OFFSET ?2"
        );
        let rows = sqlx::query(&sql)
            .bind(query.limit as i64)
            .bind(query.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_data_source).collect()
    }

    async fn insert_job_run(&self, run: &JobRun) -> CoreResult<()> {
        let rejected_json = serde_json::to_string(&run.rejected_sample)
            .map_err(|e| CoreError::backend("serialize rejected sample", e))?;
        sqlx::query(&format!(
            "INSERT INTO job_runs ({JOB_RUN_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ))
        .bind(run.id.to_string())
        .bind(run.data_source_id.to_string())
        .bind(run.organization_id.to_string())
        .bind(run.trigger.as_str())
        .bind(run.status.as_str())
        .bind(fmt_dt(run.created_at))
        .bind(run.started_at.map(fmt_dt))
        .bind(run.finished_at.map(fmt_dt))
        .bind(run.rows_staged as i64)
        .bind(run.rows_transformed as i64)
        .bind(run.rows_rejected as i64)
        .bind(&rejected_json)
        .bind(&run.error_detail)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                CoreError::Conflict(format!(
                    "data source {} already has an active run",
                    run.data_source_id
                ))
            } else {
                db_err(e)
            }
        })?;
        Ok(())
    }

    async fn transition_job_run(&self, run: &JobRun, expected: JobRunStatus) -> CoreResult<bool> {
        let rejected_json = serde_json::to_string(&run.rejected_sample)
            .map_err(|e| CoreError::backend("serialize rejected sample", e))?;
        let res = sqlx::query(
            "UPDATE job_runs SET
               status = ?1,
               started_at = ?2,
               finished_at = ?3,
               rows_staged = ?4,
               rows_transformed = ?5,
               rows_rejected = ?6,
               rejected_sample_json = ?7,
               error_detail = ?8
             WHERE id = ?9 AND organization_id = ?10 AND status = ?11",
        )
        .bind(run.status.as_str())
        .bind(run.started_at.map(fmt_dt))
        .bind(run.finished_at.map(fmt_dt))
        .bind(run.rows_staged as i64)
        .bind(run.rows_transformed as i64)
        .bind(run.rows_rejected as i64)
        .bind(&rejected_json)
        .bind(&run.error_detail)
        .bind(run.id.to_string())
        .bind(run.organization_id.to_string())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(res.rows_affected() == 1)
    }

    async fn get_job_run(&self, org_id: OrgId, job_run_id: JobRunId) -> CoreResult<Option<JobRun>> {
        let sql =
            format!("SELECT {JOB_RUN_COLUMNS} FROM job_runs WHERE organization_id = ?1 AND id = ?2");
        let row = sqlx::query(&sql)
            .bind(org_id.to_string())
            .bind(job_run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_job_run).transpose()
    }

    async fn latest_job_run(
        &self,
        org_id: OrgId,
        data_source_id: DataSourceId,
    ) -> CoreResult<Option<JobRun>> {
        let sql = format!(
            "SELECT {JOB_RUN_COLUMNS} FROM job_runs
             WHERE organization_id = ?1 AND data_source_id = ?2
             ORDER BY created_at DESC, rowid DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(org_id.to_string())
            .bind(data_source_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_job_run).transpose()
    }

    async fn list_job_runs(&self, org_id: OrgId, query: JobRunQuery) -> CoreResult<Vec<JobRun>> {
        let mut conditions = vec!["organization_id = ?1".to_string()];
        let mut next_param = 2;

        if query.data_source_id.is_some() {
            conditions.push(format!("data_source_id = ?{next_param}"));
            next_param += 1;
        }
        if query.status.is_some() {
            conditions.push(format!("status = ?{next_param}"));
            next_param += 1;
        }
        if query.since.is_some() {
            conditions.push(format!("created_at >= ?{next_param}"));
            next_param += 1;
        }
        if query.until.is_some() {
            conditions.push(format!("created_at <= ?{next_param}"));
            next_param += 1;
        }

        let sql = format!(
            "SELECT {JOB_RUN_COLUMNS} FROM job_runs WHERE {}
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?{next_param} OFFSET ?{}",
            conditions.join(" AND "),
            next_param + 1,
        );

        let mut q = sqlx::query(&sql).bind(org_id.to_string());
        if let Some(id) = query.data_source_id {
            q = q.bind(id.to_string());
        }
        if let Some(status) = query.status {
            q = q.bind(status.as_str());
        }
        if let Some(since) = query.since {
            q = q.bind(fmt_dt(since));
        }
        if let Some(until) = query.until {
            q = q.bind(fmt_dt(until));
        }
        q = q.bind(query.limit as i64).bind(query.offset as i64);

        let rows = q.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(row_to_job_run).collect()
    }
}

// ── StagingStore impl ─────────────────────────────────────────

#[async_trait]
impl StagingStore for SqlitePipelineDb {
    async fn append(&self, org_id: OrgId, job_run_id: JobRunId, rows: &[RawRow]) -> CoreResult<u64> {
        let now = fmt_dt(Utc::now());
        let org = org_id.to_string();
        let run = job_run_id.to_string();

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for row in rows {
            let payload = serde_json::to_string(row)
                .map_err(|e| CoreError::backend("serialize raw payload", e))?;
            sqlx::query(
                "INSERT INTO staged_rows (job_run_id, organization_id, raw_payload, ingested_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(&run)
            .bind(&org)
            .bind(&payload)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(rows.len() as u64)
    }

    fn read_by_run(&self, org_id: OrgId, job_run_id: JobRunId) -> StagedRowStream {
        let pool = self.pool.clone();
        Box::pin(async_stream::stream! {
            let mut after = 0i64;
            'pages: loop {
                let page = sqlx::query(
                    "SELECT seq, job_run_id, organization_id, raw_payload, ingested_at
                     FROM staged_rows
                     WHERE organization_id = ?1 AND job_run_id = ?2 AND seq > ?3
                     ORDER BY seq LIMIT ?4",
                )
                .bind(org_id.to_string())
                .bind(job_run_id.to_string())
                .bind(after)
                .bind(STAGING_PAGE_SIZE)
                .fetch_all(&pool)
                .await;

                let rows = match page {
                    Ok(rows) => rows,
                    Err(e) => {
                        yield Err(db_err(e));
                        break 'pages;
                    }
                };
                let last_page = (rows.len() as i64) < STAGING_PAGE_SIZE;
                for r in &rows {
                    match row_to_staged(r) {
                        Ok(staged) => {
                            after = staged.seq;
                            yield Ok(staged);
                        }
                        Err(e) => {
                            yield Err(e);
                            break 'pages;
                        }
                    }
                }
                if last_page {
                    break 'pages;
                }
            }
        })
    }

    async fn count_by_run(&self, org_id: OrgId, job_run_id: JobRunId) -> CoreResult<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM staged_rows WHERE organization_id = ?1 AND job_run_id = ?2",
        )
        .bind(org_id.to_string())
        .bind(job_run_id.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let n: i64 = row.get("n");
        Ok(n.max(0) as u64)
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> CoreResult<u64> {
        let res = sqlx::query("DELETE FROM staged_rows WHERE ingested_at < ?1")
            .bind(fmt_dt(cutoff))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(res.rows_affected())
    }
}

// ── CuratedStore impl ─────────────────────────────────────────

#[async_trait]
impl CuratedStore for SqlitePipelineDb {
    async fn upsert_facts(&self, org_id: OrgId, facts: &[CuratedFact]) -> CoreResult<u64> {
        ensure_facts_org(org_id, facts)?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for f in facts {
            sqlx::query(&format!(
                "INSERT INTO curated_facts ({FACT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                         ?17, ?18, ?19, ?20)
                 ON CONFLICT(organization_id, natural_key) DO UPDATE SET
                   data_source_id = excluded.data_source_id,
                   record_key = excluded.record_key,
                   period = excluded.period,
                   region = excluded.region,
                   status = excluded.status,
                   maturity_band = excluded.maturity_band,
                   creditor_code = excluded.creditor_code,
                   debtor = excluded.debtor,
                   document = excluded.document,
                   due_date = excluded.due_date,
                   amount = excluded.amount,
                   recovered_amount = excluded.recovered_amount,
                   balance = excluded.balance,
                   fee_amount = excluded.fee_amount,
                   contract_fee = excluded.contract_fee,
                   days_overdue = excluded.days_overdue,
                   source_job_run_id = excluded.source_job_run_id,
                   curated_at = excluded.curated_at"
            ))
            .bind(org_id.to_string())
            .bind(&f.natural_key)
            .bind(f.data_source_id.to_string())
            .bind(&f.record_key)
            .bind(fmt_date(f.period))
            .bind(&f.region)
            .bind(&f.status)
            .bind(&f.maturity_band)
            .bind(&f.creditor_code)
            .bind(&f.debtor)
            .bind(&f.document)
            .bind(f.due_date.map(fmt_date))
            .bind(f.amount)
            .bind(f.recovered_amount)
            .bind(f.balance)
            .bind(f.fee_amount)
            .bind(f.contract_fee)
            .bind(f.days_overdue)
            .bind(f.source_job_run_id.to_string())
            .bind(fmt_dt(f.curated_at))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(facts.len() as u64)
    }

    async fn query_facts(&self, org_id: OrgId, query: &FactQuery) -> CoreResult<Vec<CuratedFact>> {
        let mut conditions = vec!["organization_id = ?1".to_string()];
        let mut next_param = 2;

        let mut push = |col: &str, op: &str, present: bool| {
            if present {
                conditions.push(format!("{col} {op} ?{next_param}"));
                next_param += 1;
            }
        };
        push("period", ">=", query.from.is_some());
        push("period", "<=", query.to.is_some());
        push("region", "=", query.region.is_some());
        push("status", "=", query.status.is_some());
        push("creditor_code", "=", query.creditor_code.is_some());
        push("data_source_id", "=", query.data_source_id.is_some());

        let sql = format!(
            "SELECT {FACT_COLUMNS} FROM curated_facts WHERE {}
             ORDER BY period, natural_key
             LIMIT ?{next_param} OFFSET ?{}",
            conditions.join(" AND "),
            next_param + 1,
        );

        let mut q = sqlx::query(&sql).bind(org_id.to_string());
        if let Some(from) = query.from {
            q = q.bind(fmt_date(from));
        }
        if let Some(to) = query.to {
            q = q.bind(fmt_date(to));
        }
        if let Some(region) = &query.region {
            q = q.bind(region.clone());
        }
        if let Some(status) = &query.status {
            q = q.bind(status.clone());
        }
        if let Some(code) = &query.creditor_code {
            q = q.bind(code.clone());
        }
        if let Some(id) = query.data_source_id {
            q = q.bind(id.to_string());
        }
        q = q.bind(query.limit as i64).bind(query.offset as i64);

        let rows = q.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(row_to_fact).collect()
    }

    async fn count_facts(&self, org_id: OrgId) -> CoreResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM curated_facts WHERE organization_id = ?1")
            .bind(org_id.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let n: i64 = row.get("n");
        Ok(n.max(0) as u64)
    }

    async fn aggregate(
        &self,
        org_id: OrgId,
        query: &AggregateQuery,
    ) -> CoreResult<Vec<IndicatorRow>> {
        let mut q = sqlx::query(aggregate_sql(query.shape))
            .bind(org_id.to_string())
            .bind(query.from.map(fmt_date))
            .bind(query.to.map(fmt_date))
            .bind(query.region.clone())
            .bind(query.status.clone())
            .bind(query.creditor_code.clone());
        if query.shape.is_maturity_band() {
            q = q.bind(fmt_date(query.as_of));
        }
        let rows = q.fetch_all(&self.pool).await.map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|r| {
                let bucket: String = r.get("bucket");
                let total: f64 = r.get("total");
                let fact_count: i64 = r.get("fact_count");
                IndicatorRow {
                    bucket,
                    total,
                    fact_count: fact_count.max(0) as u64,
                }
            })
            .collect())
    }
}
