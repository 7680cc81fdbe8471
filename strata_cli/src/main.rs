use clap::Parser;
use serde::{Deserialize, Serialize};
use strata_cli::backends::build_backends;
use strata_cli::cli::{Cli, Commands};
use strata_core::ingest::traits::IngestionService;
use strata_core::{
    DataSource, DataSourceId, FileFormat, IndicatorParams, JobRunQuery, JobRunStatus, ListQuery,
    PipelineConfig, SourceCatalog, SourceConfig,
};

/// JSON accepted by `add-source`.
#[derive(Debug, Deserialize)]
struct SourceInput {
    /// Updates the existing source when set.
    id: Option<DataSourceId>,
    name: String,
    config: SourceConfig,
    #[serde(default)]
    is_recurring: bool,
    interval_minutes: Option<u32>,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    strata_core::o11y::init_tracing_from_env()?;
    let cli = Cli::parse();

    let mut config = PipelineConfig::from_env()?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    let backends = build_backends(config).await?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let handle = backends.scheduler()?.start();
            tokio::signal::ctrl_c().await?;
            handle.shutdown();
        }
        Commands::AddOrg { slug, name } => {
            let org = backends.engine.create_organization(&slug, &name).await?;
            print_json(&org)?;
        }
        Commands::AddSource { org, json } => {
            let org_id = backends.resolve_org(&org).await?;
            let raw = match json.strip_prefix('@') {
                Some(path) => tokio::fs::read_to_string(path).await?,
                None => json,
            };
            let input: SourceInput = serde_json::from_str(&raw)?;
            let mut source = DataSource::new(
                org_id,
                input.name,
                input.config,
                input.is_recurring,
                input.interval_minutes,
                None,
            )?;
            if let Some(id) = input.id {
                let Some(existing) = backends.catalog.get_data_source(org_id, id).await? else {
                    anyhow::bail!("data source {id} not found");
                };
                source.id = id;
                source.created_at = existing.created_at;
                source.enabled = existing.enabled;
            }
            let saved = backends.engine.register_source(source).await?;
            print_json(&saved)?;
        }
        Commands::Sources { org } => {
            let org_id = backends.resolve_org(&org).await?;
            let sources = backends
                .engine
                .list_sources(org_id, ListQuery::default())
                .await?;
            print_json(&sources)?;
        }
        Commands::DisableSource { org, source_id } => {
            let org_id = backends.resolve_org(&org).await?;
            let source = backends
                .engine
                .disable_source(org_id, DataSourceId(source_id))
                .await?;
            print_json(&source)?;
        }
        Commands::Trigger { org, source_id } => {
            let org_id = backends.resolve_org(&org).await?;
            let run = backends
                .engine
                .trigger_ingestion(org_id, DataSourceId(source_id))
                .await?;
            print_json(&run)?;
        }
        Commands::Upload {
            org,
            source_id,
            file,
        } => {
            let org_id = backends.resolve_org(&org).await?;
            let bytes = tokio::fs::read(&file).await?;
            let run = backends
                .engine
                .ingest_upload(
                    org_id,
                    DataSourceId(source_id),
                    bytes,
                    Some(FileFormat::from_path(&file)),
                )
                .await?;
            print_json(&run)?;
        }
        Commands::Indicator {
            org,
            name,
            from,
            to,
            filters,
        } => {
            let org_id = backends.resolve_org(&org).await?;
            let params = IndicatorParams::parse(from.as_deref(), to.as_deref(), filters)?;
            let rows = backends.indicators.run(&name, org_id, &params).await?;
            print_json(&rows)?;
        }
        Commands::Indicators => {
            print_json(&backends.indicators.list())?;
        }
        Commands::Runs {
            org,
            source_id,
            status,
            limit,
        } => {
            let org_id = backends.resolve_org(&org).await?;
            let status = match status.as_deref() {
                Some(s) => match JobRunStatus::parse_str(s) {
                    Some(parsed) => Some(parsed),
                    None => anyhow::bail!("unknown job run status '{s}'"),
                },
                None => None,
            };
            let runs = backends
                .engine
                .list_job_runs(
                    org_id,
                    JobRunQuery {
                        data_source_id: source_id.map(DataSourceId),
                        status,
                        limit,
                        ..Default::default()
                    },
                )
                .await?;
            print_json(&runs)?;
        }
        Commands::PruneStaging { older_than_days } => {
            let older_than = older_than_days
                .map(|d| std::time::Duration::from_secs(d * 24 * 60 * 60))
                .unwrap_or(backends.config.staging_retention);
            let removed = backends.engine.prune_staging(older_than).await?;
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
    }

    Ok(())
}
