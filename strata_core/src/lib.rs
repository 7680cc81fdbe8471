//! Strata core: multi-tenant ingestion into staging, transformation into
//! curated facts, and fixed-shape indicators over them.

pub mod config;
pub mod connectors;
pub mod error;
pub mod indicators;
pub mod ingest;
pub mod models;
pub mod o11y;
pub mod storage;
pub mod transform;

pub use config::PipelineConfig;
pub use connectors::{Connector, CredentialProvider, RawRow, RowStream};
pub use error::{Error, Result};
pub use indicators::{IndicatorEngine, IndicatorParams, IndicatorRow};
pub use ingest::engine::IngestionEngine;
pub use ingest::models::{
    DataSource, DueDecision, FileFormat, JobRun, JobRunQuery, JobRunStatus, JobTrigger,
    RejectedRow, SourceConfig, SourceKind,
};
pub use ingest::schedule::{Scheduler, SchedulerContext, SchedulerHandle, TickReport};
pub use ingest::traits::{IngestionDeps, IngestionService, SourceStatus};
pub use models::{DataSourceId, JobRunId, OrgId, Organization};
pub use storage::models::{CuratedFact, FactQuery, ListQuery, StagedRow};
pub use storage::traits::{CuratedStore, SourceCatalog, StagingStore};
pub use storage::{MemoryPipelineDb, SqlitePipelineDb};
pub use transform::{TransformReport, Transformer};
