//! Global tracing setup.
//!
//! JSON lines on stderr by default; `STRATA_LOG_FORMAT=pretty` switches to the
//! human-readable formatter. Filtering follows `RUST_LOG` (default `info`).

use crate::{Error, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var("STRATA_LOG_FORMAT").ok().as_deref() {
            Some("pretty") | Some("text") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

/// Install the global subscriber. Fails with `Conflict` if one is already set.
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let res = match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    res.map_err(|e| Error::Conflict(format!("tracing already initialized: {e}")))
}

pub fn init_tracing_from_env() -> Result<()> {
    init_tracing(LogFormat::from_env())
}
