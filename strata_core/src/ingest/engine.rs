use crate::config::{to_chrono, PipelineConfig};
use crate::connectors::{Connector, FileConnector, RawRow, RowStream};
use crate::ingest::models::{
    DataSource, FileFormat, JobRun, JobRunQuery, JobRunStatus, JobTrigger, SourceConfig,
    SourceKind,
};
use crate::ingest::traits::{IngestionDeps, IngestionService, SourceStatus};
use crate::models::{DataSourceId, JobRunId, OrgId, Organization};
use crate::storage::models::ListQuery;
use crate::storage::traits::{SourceCatalog, StagingStore};
use crate::transform::Transformer;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Where a run's raw rows come from.
enum RowOrigin {
    Connector,
    Upload { bytes: Vec<u8>, format: FileFormat },
}

/// Default ingestion implementation: owns the job run lifecycle and drives
/// connector → staging → transformer → curated for one run at a time.
pub struct IngestionEngine {
    catalog: Arc<dyn SourceCatalog>,
    staging: Arc<dyn StagingStore>,
    transformer: Transformer,
    connectors: RwLock<HashMap<SourceKind, Arc<dyn Connector>>>,
    batch_size: usize,
    stale_after: chrono::Duration,
}

impl IngestionEngine {
    #[tracing::instrument(level = "debug", skip(deps, config))]
    pub fn new(deps: IngestionDeps, config: &PipelineConfig) -> Result<Self> {
        let batch_size = config.staging_batch_size.max(1);
        Ok(Self {
            transformer: Transformer::new(deps.staging.clone(), deps.curated.clone(), batch_size),
            catalog: deps.catalog,
            staging: deps.staging,
            connectors: RwLock::new(HashMap::new()),
            batch_size,
            stale_after: to_chrono(config.stale_after)?,
        })
    }

    pub fn stale_after(&self) -> chrono::Duration {
        self.stale_after
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn create_organization(&self, slug: &str, name: &str) -> Result<Organization> {
        if self.catalog.get_organization_by_slug(slug).await?.is_some() {
            return Err(Error::Conflict(format!("organization '{slug}' already exists")));
        }
        let org = Organization::new(slug, name, None)?;
        self.catalog.upsert_organization(&org).await?;
        Ok(org)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn list_sources(&self, org_id: OrgId, query: ListQuery) -> Result<Vec<DataSource>> {
        self.catalog.list_data_sources(org_id, query).await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn list_job_runs(&self, org_id: OrgId, query: JobRunQuery) -> Result<Vec<JobRun>> {
        self.catalog.list_job_runs(org_id, query).await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_job_run(&self, org_id: OrgId, job_run_id: JobRunId) -> Result<JobRun> {
        self.catalog
            .get_job_run(org_id, job_run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job run {job_run_id} not found")))
    }

    /// Delete staged rows older than `older_than`. Administrative only.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn prune_staging(&self, older_than: std::time::Duration) -> Result<u64> {
        let cutoff = Utc::now() - to_chrono(older_than)?;
        let removed = self.staging.prune_before(cutoff).await?;
        tracing::info!(removed, %cutoff, "pruned staged rows");
        Ok(removed)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn load_source(&self, org_id: OrgId, data_source_id: DataSourceId) -> Result<DataSource> {
        self.catalog
            .get_data_source(org_id, data_source_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("data source {data_source_id} not found")))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_connector(&self, kind: SourceKind) -> Result<Arc<dyn Connector>> {
        let connectors = self.connectors.read().await;
        connectors
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no connector registered for {kind}")))
    }

    /// Create a pending run. Fails with `Conflict` while another run is active.
    #[tracing::instrument(level = "debug", skip(self, source), fields(data_source_id = %source.id))]
    pub async fn dispatch(
        &self,
        source: &DataSource,
        trigger: JobTrigger,
        now: DateTime<Utc>,
    ) -> Result<JobRun> {
        let run = JobRun::new_pending(source, trigger, now);
        self.catalog.insert_job_run(&run).await?;
        tracing::debug!(job_run_id = %run.id, trigger = trigger.as_str(), "job run dispatched");
        Ok(run)
    }

    /// Fail a run whose lease ran out. Returns `false` if it moved meanwhile.
    #[tracing::instrument(level = "info", skip(self, run), fields(job_run_id = %run.id))]
    pub async fn expire_lease(&self, mut run: JobRun, now: DateTime<Utc>) -> Result<bool> {
        let expected = run.mark_lease_expired(now)?;
        let moved = self.catalog.transition_job_run(&run, expected).await?;
        if moved {
            tracing::warn!(
                data_source_id = %run.data_source_id,
                previous = expected.as_str(),
                "abandoned job run failed after lease expiry"
            );
        }
        Ok(moved)
    }

    /// Clear the way for a new run of `source`, or fail with `Conflict`.
    async fn begin_run(&self, source: &DataSource, trigger: JobTrigger) -> Result<JobRun> {
        if !source.enabled {
            return Err(Error::Conflict(format!("data source {} is disabled", source.id)));
        }
        let now = Utc::now();
        if let Some(last) = self
            .catalog
            .latest_job_run(source.organization_id, source.id)
            .await?
        {
            if !last.status.is_terminal() {
                if !last.is_stale(now, self.stale_after) {
                    return Err(Error::Conflict(format!(
                        "data source {} already has active run {}",
                        source.id, last.id
                    )));
                }
                self.expire_lease(last, now).await?;
            }
        }
        self.dispatch(source, trigger, now).await
    }

    /// Claim a pending run and drive it to a terminal state.
    ///
    /// Pipeline failures end up on the run record, not in the returned
    /// `Result`; `Err` means the catalog itself could not be updated.
    #[tracing::instrument(level = "info", skip(self, run), fields(job_run_id = %run.id, data_source_id = %run.data_source_id, org_id = %run.organization_id))]
    pub async fn execute(&self, run: JobRun) -> Result<JobRun> {
        self.execute_from(run, RowOrigin::Connector).await
    }

    async fn execute_from(&self, mut run: JobRun, origin: RowOrigin) -> Result<JobRun> {
        let expected = run.mark_running(Utc::now())?;
        if !self.catalog.transition_job_run(&run, expected).await? {
            tracing::info!("job run already claimed elsewhere");
            return self.get_job_run(run.organization_id, run.id).await;
        }

        match self.run_pipeline(&mut run, origin).await {
            Ok(()) => {
                run.mark_succeeded(Utc::now())?;
                tracing::info!(
                    rows_staged = run.rows_staged,
                    rows_transformed = run.rows_transformed,
                    rows_rejected = run.rows_rejected,
                    "job run succeeded"
                );
            }
            Err(e) => {
                run.mark_failed(Utc::now(), &e)?;
                tracing::warn!(
                    error = %e,
                    code = e.code(),
                    rows_staged = run.rows_staged,
                    "job run failed"
                );
            }
        }

        if !self
            .catalog
            .transition_job_run(&run, JobRunStatus::Running)
            .await?
        {
            tracing::warn!("job run lease expired before completion; keeping stored outcome");
            return self.get_job_run(run.organization_id, run.id).await;
        }
        Ok(run)
    }

    async fn run_pipeline(&self, run: &mut JobRun, origin: RowOrigin) -> Result<()> {
        let source = self.load_source(run.organization_id, run.data_source_id).await?;

        let rows: RowStream = match origin {
            RowOrigin::Connector => {
                let connector = self.get_connector(source.kind()).await?;
                connector.fetch(run.organization_id, &source).await?
            }
            RowOrigin::Upload { bytes, format } => {
                let delimiter = match &source.config {
                    SourceConfig::CsvUpload { delimiter, .. } => *delimiter,
                    _ => None,
                };
                FileConnector::parse(bytes, format, delimiter)?
            }
        };

        self.stage(run, rows).await?;

        let report = self.transformer.transform(&source, run).await?;
        report.apply_to(run);
        report.ensure_survivors()
    }

    /// Drain `rows` into staging in batches. On a mid-stream failure, rows
    /// already received are still staged and counted.
    async fn stage(&self, run: &mut JobRun, mut rows: RowStream) -> Result<()> {
        let mut buf: Vec<RawRow> = Vec::with_capacity(self.batch_size);
        while let Some(next) = rows.next().await {
            match next {
                Ok(row) => buf.push(row),
                Err(e) => {
                    self.flush(run, &mut buf).await?;
                    return Err(e);
                }
            }
            if buf.len() >= self.batch_size {
                self.flush(run, &mut buf).await?;
            }
        }
        self.flush(run, &mut buf).await?;
        tracing::debug!(rows_staged = run.rows_staged, "staging finished");
        Ok(())
    }

    async fn flush(&self, run: &mut JobRun, buf: &mut Vec<RawRow>) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let appended = self
            .staging
            .append(run.organization_id, run.id, buf)
            .await?;
        run.rows_staged += appended;
        buf.clear();
        Ok(())
    }
}

#[async_trait]
impl IngestionService for IngestionEngine {
    #[tracing::instrument(level = "debug", skip(self, connector))]
    async fn register_connector(&self, connector: Arc<dyn Connector>) -> Result<()> {
        let mut connectors = self.connectors.write().await;
        connectors.insert(connector.kind(), connector);
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self, source), fields(data_source_id = %source.id, org_id = %source.organization_id))]
    async fn register_source(&self, mut source: DataSource) -> Result<DataSource> {
        source.validate()?;
        if self
            .catalog
            .get_organization(source.organization_id)
            .await?
            .is_none()
        {
            return Err(Error::NotFound(format!(
                "organization {} not found",
                source.organization_id
            )));
        }
        self.get_connector(source.kind()).await?;

        source.touch(Utc::now());
        self.catalog.upsert_data_source(&source).await?;
        Ok(source)
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn disable_source(
        &self,
        org_id: OrgId,
        data_source_id: DataSourceId,
    ) -> Result<DataSource> {
        let mut source = self.load_source(org_id, data_source_id).await?;
        source.enabled = false;
        source.touch(Utc::now());
        self.catalog.upsert_data_source(&source).await?;
        Ok(source)
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn trigger_ingestion(
        &self,
        org_id: OrgId,
        data_source_id: DataSourceId,
    ) -> Result<JobRun> {
        let source = self.load_source(org_id, data_source_id).await?;
        let run = self.begin_run(&source, JobTrigger::OnDemand).await?;
        self.execute(run).await
    }

    #[tracing::instrument(level = "info", skip(self, bytes), fields(len = bytes.len()))]
    async fn ingest_upload(
        &self,
        org_id: OrgId,
        data_source_id: DataSourceId,
        bytes: Vec<u8>,
        format: Option<FileFormat>,
    ) -> Result<JobRun> {
        let source = self.load_source(org_id, data_source_id).await?;
        let SourceConfig::CsvUpload {
            format: configured, ..
        } = &source.config
        else {
            return Err(Error::InvalidInput(format!(
                "uploads require a csv_upload source, {} is {}",
                source.id,
                source.kind()
            )));
        };
        let format = format.unwrap_or(*configured);
        let run = self.begin_run(&source, JobTrigger::Upload).await?;
        self.execute_from(run, RowOrigin::Upload { bytes, format })
            .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_status(
        &self,
        org_id: OrgId,
        data_source_id: DataSourceId,
    ) -> Result<SourceStatus> {
        let source = self.load_source(org_id, data_source_id).await?;
        let last_run = self.catalog.latest_job_run(org_id, data_source_id).await?;
        Ok(SourceStatus {
            org_id,
            source,
            last_run,
            checked_at: Utc::now(),
        })
    }
}
