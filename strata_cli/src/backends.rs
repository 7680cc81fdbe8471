use std::sync::Arc;

use strata_core::connectors::{default_connectors, CredentialProvider, StaticCredentials};
use strata_core::ingest::traits::{IngestionDeps, IngestionService};
use strata_core::{
    IndicatorEngine, IngestionEngine, OrgId, PipelineConfig, Scheduler, SchedulerContext,
    SourceCatalog, SqlitePipelineDb,
};

/// Everything a command needs, wired against the SQLite pipeline database.
pub struct Backends {
    pub config: PipelineConfig,
    pub catalog: Arc<dyn SourceCatalog>,
    pub engine: Arc<IngestionEngine>,
    pub indicators: IndicatorEngine,
}

impl Backends {
    pub fn scheduler(&self) -> anyhow::Result<Arc<Scheduler>> {
        let ctx = SchedulerContext::from_config(self.engine.clone(), self.catalog.clone(), &self.config)?;
        Ok(Arc::new(Scheduler::new(ctx)?))
    }

    /// Accept an organization id or slug.
    pub async fn resolve_org(&self, org: &str) -> anyhow::Result<OrgId> {
        if let Ok(id) = org.parse::<OrgId>() {
            return Ok(id);
        }
        match self.catalog.get_organization_by_slug(org).await? {
            Some(found) => Ok(found.id),
            None => anyhow::bail!("organization '{org}' not found"),
        }
    }
}

#[tracing::instrument(level = "info", skip(config))]
pub async fn build_backends(config: PipelineConfig) -> anyhow::Result<Backends> {
    config.validate()?;
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let db = Arc::new(SqlitePipelineDb::new(config.database_path()).await?);

    let credentials: Arc<dyn CredentialProvider> = match &config.credentials_file {
        Some(path) => Arc::new(StaticCredentials::from_json_file(path).await?),
        None => {
            tracing::info!("no credentials file configured; spreadsheet API sources will fail with AuthError");
            Arc::new(StaticCredentials::new())
        }
    };

    let engine = Arc::new(IngestionEngine::new(IngestionDeps::shared(db.clone()), &config)?);
    for connector in default_connectors(&config, credentials)? {
        engine.register_connector(connector).await?;
    }

    Ok(Backends {
        indicators: IndicatorEngine::new(db.clone()),
        catalog: db,
        engine,
        config,
    })
}
