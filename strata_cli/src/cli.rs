use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "strata", version, about = "Multi-tenant ingestion and indicator pipeline")]
pub struct Cli {
    /// Directory holding the pipeline database.
    #[arg(long, global = true, env = "STRATA_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the recurring scheduler and its workers until interrupted (default).
    Serve,

    /// Create an organization.
    AddOrg {
        /// Lowercase slug, unique across organizations.
        slug: String,
        #[arg(long)]
        name: String,
    },

    /// Register or update a data source from JSON (`@path` reads a file).
    ///
    /// Shape: `{"name", "config": {"kind", ...}, "is_recurring", "interval_minutes"}`.
    AddSource {
        /// Organization slug or id.
        #[arg(long)]
        org: String,
        json: String,
    },

    /// List an organization's data sources.
    Sources {
        #[arg(long)]
        org: String,
    },

    /// Soft-disable a data source.
    DisableSource {
        #[arg(long)]
        org: String,
        source_id: Uuid,
    },

    /// Run one ingestion now and wait for it to finish.
    Trigger {
        #[arg(long)]
        org: String,
        source_id: Uuid,
    },

    /// Ingest a CSV or XLSX file into a csv_upload source.
    Upload {
        #[arg(long)]
        org: String,
        source_id: Uuid,
        file: PathBuf,
    },

    /// Evaluate an indicator.
    Indicator {
        #[arg(long)]
        org: String,
        name: String,
        /// Inclusive lower bound, YYYY-MM-DD.
        #[arg(long)]
        from: Option<String>,
        /// Inclusive upper bound, YYYY-MM-DD.
        #[arg(long)]
        to: Option<String>,
        /// Dimension filter as `key=value`; repeatable.
        #[arg(long = "filter", value_parser = parse_key_val)]
        filters: Vec<(String, String)>,
    },

    /// List available indicators.
    Indicators,

    /// Job run history for an organization.
    Runs {
        #[arg(long)]
        org: String,
        #[arg(long)]
        source_id: Option<Uuid>,
        /// pending | running | succeeded | failed
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Delete staged rows older than the retention window.
    PruneStaging {
        /// Defaults to STRATA_STAGING_RETENTION_DAYS.
        #[arg(long)]
        older_than_days: Option<u64>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    Ok((k.trim().to_string(), v.to_string()))
}
