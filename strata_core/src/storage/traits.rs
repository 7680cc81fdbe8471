use crate::connectors::RawRow;
use crate::ingest::models::{DataSource, JobRun, JobRunQuery, JobRunStatus};
use crate::models::{DataSourceId, JobRunId, OrgId, Organization};
use crate::storage::models::{
    AggregateQuery, CuratedFact, FactQuery, IndicatorRow, ListQuery, StagedRow,
};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use std::pin::Pin;

/// Lazy, restartable sequence of staged rows for one run.
pub type StagedRowStream = Pin<Box<dyn Stream<Item = Result<StagedRow>> + Send + 'static>>;

/// Organizations, data source configuration, and the job run audit trail.
#[async_trait]
pub trait SourceCatalog: Send + Sync {
    async fn upsert_organization(&self, org: &Organization) -> Result<()>;
    async fn get_organization(&self, org_id: OrgId) -> Result<Option<Organization>>;
    async fn get_organization_by_slug(&self, slug: &str) -> Result<Option<Organization>>;

    async fn upsert_data_source(&self, source: &DataSource) -> Result<()>;
    async fn get_data_source(
        &self,
        org_id: OrgId,
        data_source_id: DataSourceId,
    ) -> Result<Option<DataSource>>;
    async fn list_data_sources(&self, org_id: OrgId, query: ListQuery) -> Result<Vec<DataSource>>;

    /// Recurring sources across all tenants. Reserved for scheduler discovery.
    async fn list_recurring_sources(&self, query: ListQuery) -> Result<Vec<DataSource>>;

    /// Fails with `Conflict` while the source already has a pending or running run.
    async fn insert_job_run(&self, run: &JobRun) -> Result<()>;

    /// Persist `run` only if the stored status still equals `expected`.
    ///
    /// Returns `false` when another writer moved the run first.
    async fn transition_job_run(&self, run: &JobRun, expected: JobRunStatus) -> Result<bool>;

    async fn get_job_run(&self, org_id: OrgId, job_run_id: JobRunId) -> Result<Option<JobRun>>;
    /// Most recently created run of a source.
    async fn latest_job_run(
        &self,
        org_id: OrgId,
        data_source_id: DataSourceId,
    ) -> Result<Option<JobRun>>;
    async fn list_job_runs(&self, org_id: OrgId, query: JobRunQuery) -> Result<Vec<JobRun>>;
}

/// Append-only landing area for raw rows.
#[async_trait]
pub trait StagingStore: Send + Sync {
    async fn append(&self, org_id: OrgId, job_run_id: JobRunId, rows: &[RawRow]) -> Result<u64>;

    /// Rows of one run in insertion order. Re-reading yields the same rows.
    fn read_by_run(&self, org_id: OrgId, job_run_id: JobRunId) -> StagedRowStream;

    async fn count_by_run(&self, org_id: OrgId, job_run_id: JobRunId) -> Result<u64>;

    /// Retention pruning. Administrative, never called by the pipeline.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Tenant-scoped analytical storage.
#[async_trait]
pub trait CuratedStore: Send + Sync {
    /// Upsert by `(organization_id, natural_key)`. Any fact from another
    /// organization rejects the whole batch with `Unauthorized`.
    async fn upsert_facts(&self, org_id: OrgId, facts: &[CuratedFact]) -> Result<u64>;

    /// Ordered by `(period, natural_key)`.
    async fn query_facts(&self, org_id: OrgId, query: &FactQuery) -> Result<Vec<CuratedFact>>;

    async fn count_facts(&self, org_id: OrgId) -> Result<u64>;

    async fn aggregate(&self, org_id: OrgId, query: &AggregateQuery) -> Result<Vec<IndicatorRow>>;
}

/// Reject a batch if any fact belongs to another organization.
pub fn ensure_facts_org(org_id: OrgId, facts: &[CuratedFact]) -> Result<()> {
    for fact in facts {
        crate::models::ensure_same_org(org_id, fact.organization_id, "curated fact")?;
    }
    Ok(())
}
