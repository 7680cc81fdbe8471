use crate::connectors::Connector;
use crate::ingest::models::{DataSource, FileFormat, JobRun};
use crate::models::{DataSourceId, OrgId};
use crate::storage::traits::{CuratedStore, SourceCatalog, StagingStore};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Current state of one source as seen by its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub org_id: OrgId,
    pub source: DataSource,
    pub last_run: Option<JobRun>,
    pub checked_at: DateTime<Utc>,
}

#[async_trait]
pub trait IngestionService: Send + Sync {
    /// Register an in-process connector; replaces any connector of the same kind.
    async fn register_connector(&self, connector: Arc<dyn Connector>) -> Result<()>;

    /// Create or update a source configuration. The organization must exist.
    async fn register_source(&self, source: DataSource) -> Result<DataSource>;

    /// Soft-disable a source. Its history is kept.
    async fn disable_source(&self, org_id: OrgId, data_source_id: DataSourceId)
        -> Result<DataSource>;

    /// Run one ingestion to a terminal state and return the final run record.
    async fn trigger_ingestion(&self, org_id: OrgId, data_source_id: DataSourceId)
        -> Result<JobRun>;

    /// Ingest an uploaded file for a `csv_upload` source.
    async fn ingest_upload(
        &self,
        org_id: OrgId,
        data_source_id: DataSourceId,
        bytes: Vec<u8>,
        format: Option<FileFormat>,
    ) -> Result<JobRun>;

    async fn get_status(&self, org_id: OrgId, data_source_id: DataSourceId)
        -> Result<SourceStatus>;
}

/// Shared dependencies required to run ingestion.
///
/// `IngestionEngine::new` takes these as trait objects.
#[derive(Clone)]
pub struct IngestionDeps {
    pub catalog: Arc<dyn SourceCatalog>,
    pub staging: Arc<dyn StagingStore>,
    pub curated: Arc<dyn CuratedStore>,
}

impl IngestionDeps {
    /// One backend serving all three stores.
    pub fn shared<B>(backend: Arc<B>) -> Self
    where
        B: SourceCatalog + StagingStore + CuratedStore + 'static,
    {
        Self {
            catalog: backend.clone(),
            staging: backend.clone(),
            curated: backend,
        }
    }
}
