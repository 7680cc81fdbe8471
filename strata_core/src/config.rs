use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the pipeline and its scheduler.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory holding the pipeline database.
    pub data_dir: PathBuf,
    /// Explicit database file; defaults to `{data_dir}/strata.db`.
    pub database_path: Option<PathBuf>,
    pub poll_interval: Duration,
    pub default_source_interval: Duration,
    /// Age after which a pending/running job run is treated as abandoned.
    pub stale_after: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
    pub staging_batch_size: usize,
    pub sql_connect_timeout: Duration,
    pub http_timeout: Duration,
    pub sheets_api_base: String,
    pub staging_retention: Duration,
    pub credentials_file: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".strata"),
            database_path: None,
            poll_interval: minutes(60),
            default_source_interval: minutes(60),
            stale_after: minutes(180),
            workers: 4,
            queue_capacity: 256,
            staging_batch_size: 2000,
            sql_connect_timeout: Duration::from_secs(20),
            http_timeout: Duration::from_secs(20),
            sheets_api_base: "https://sheets.googleapis.com".to_string(),
            staging_retention: Duration::from_secs(30 * 24 * 60 * 60),
            credentials_file: None,
        }
    }
}

impl PipelineConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let cfg = Self {
            data_dir: std::env::var("STRATA_DATA_DIR")
                .ok()
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            database_path: std::env::var("STRATA_DATABASE_URL")
                .ok()
                .map(|v| PathBuf::from(v.trim_start_matches("sqlite://"))),
            poll_interval: env_u64("STRATA_POLL_INTERVAL_MINUTES")?
                .map(minutes)
                .unwrap_or(defaults.poll_interval),
            default_source_interval: env_u64("STRATA_DEFAULT_SOURCE_INTERVAL_MINUTES")?
                .map(minutes)
                .unwrap_or(defaults.default_source_interval),
            stale_after: env_u64("STRATA_STALE_RUN_AFTER_MINUTES")?
                .map(minutes)
                .unwrap_or(defaults.stale_after),
            workers: env_u64("STRATA_WORKERS")?
                .map(|v| v as usize)
                .unwrap_or(defaults.workers),
            queue_capacity: env_u64("STRATA_QUEUE_CAPACITY")?
                .map(|v| v as usize)
                .unwrap_or(defaults.queue_capacity),
            staging_batch_size: env_u64("STRATA_STAGING_BATCH_SIZE")?
                .map(|v| v as usize)
                .unwrap_or(defaults.staging_batch_size),
            sql_connect_timeout: env_u64("STRATA_SQL_CONNECT_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.sql_connect_timeout),
            http_timeout: env_u64("STRATA_HTTP_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.http_timeout),
            sheets_api_base: std::env::var("STRATA_SHEETS_API_BASE")
                .unwrap_or(defaults.sheets_api_base),
            staging_retention: env_u64("STRATA_STAGING_RETENTION_DAYS")?
                .map(|d| Duration::from_secs(d * 24 * 60 * 60))
                .unwrap_or(defaults.staging_retention),
            credentials_file: std::env::var("STRATA_CREDENTIALS_FILE")
                .ok()
                .map(PathBuf::from),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidInput("poll_interval must be > 0".to_string()));
        }
        if self.default_source_interval.is_zero() {
            return Err(Error::InvalidInput(
                "default_source_interval must be > 0".to_string(),
            ));
        }
        if self.stale_after.is_zero() {
            return Err(Error::InvalidInput("stale_after must be > 0".to_string()));
        }
        if self.workers == 0 {
            return Err(Error::InvalidInput("workers must be > 0".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidInput("queue_capacity must be > 0".to_string()));
        }
        if self.staging_batch_size == 0 {
            return Err(Error::InvalidInput(
                "staging_batch_size must be > 0".to_string(),
            ));
        }
        if self.sheets_api_base.trim().is_empty() {
            return Err(Error::InvalidInput("sheets_api_base is empty".to_string()));
        }
        if self.stale_after < self.poll_interval {
            tracing::warn!(
                stale_after_secs = self.stale_after.as_secs(),
                poll_interval_secs = self.poll_interval.as_secs(),
                "stale run timeout is shorter than the poll interval"
            );
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("strata.db"))
    }
}

/// Convert a configured span for timestamp arithmetic.
pub fn to_chrono(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d)
        .map_err(|_| Error::InvalidInput(format!("duration {d:?} is out of range")))
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => v
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| Error::InvalidInput(format!("{key} must be a non-negative integer"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = PipelineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_secs(3600));
        assert_eq!(cfg.staging_batch_size, 2000);
        assert_eq!(cfg.database_path(), PathBuf::from(".strata/strata.db"));
    }

    #[test]
    fn zero_workers_rejected() {
        let cfg = PipelineConfig {
            workers: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidInput(_))));
    }
}
