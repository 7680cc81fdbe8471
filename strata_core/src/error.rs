use std::error::Error as StdError;

/// Common error type for `strata_core`.
///
/// The pipeline variants (`Connection` through `InvalidParam`) form the
/// failure taxonomy recorded on job runs. Storage drivers keep their error
/// chain via `Error::backend`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// A read or write crossed an organization boundary.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("source unreachable: {0}")]
    Connection(String),

    #[error("credential missing or rejected: {0}")]
    Auth(String),

    #[error("malformed source data: {0}")]
    Parse(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("type coercion failed: {0}")]
    TypeCoercion(String),

    #[error("unknown indicator: {0}")]
    UnknownIndicator(String),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

/// `code()` of credential failures. Runs that failed with it are not retried by the scheduler.
pub const AUTH_ERROR_CODE: &str = "AuthError";

impl Error {
    #[tracing::instrument(level = "debug", name = "strata.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Stable label used as the prefix of `JobRun.error_detail`.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "InvalidInput",
            Error::NotFound(_) => "NotFound",
            Error::Conflict(_) => "Conflict",
            Error::Unauthorized(_) => "Unauthorized",
            Error::Connection(_) => "ConnectionError",
            Error::Auth(_) => AUTH_ERROR_CODE,
            Error::Parse(_) => "ParseError",
            Error::SchemaMismatch(_) => "SchemaMismatch",
            Error::TypeCoercion(_) => "TypeCoercionError",
            Error::UnknownIndicator(_) => "UnknownIndicator",
            Error::InvalidParam(_) => "InvalidParam",
            Error::Backend { .. } | Error::BackendMessage(_) => "BackendError",
        }
    }

    /// Connection failures are picked up again by the next scheduler tick.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// `"<code>: <message>"`, the form persisted on failed job runs.
    pub fn detail(&self) -> String {
        let mut msg = self.to_string();
        let mut source = StdError::source(self);
        while let Some(s) = source {
            msg.push_str(": ");
            msg.push_str(&s.to_string());
            source = s.source();
        }
        format!("{}: {}", self.code(), msg)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_is_prefixed_with_code() {
        let e = Error::Auth("no credential for org".to_string());
        assert_eq!(
            e.detail(),
            "AuthError: credential missing or rejected: no credential for org"
        );
        assert!(!e.is_retryable());
        assert!(Error::Connection("refused".into()).is_retryable());
    }

    #[test]
    fn detail_includes_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let e = Error::backend("sqlite_pipeline_db", io);
        assert_eq!(
            e.detail(),
            "BackendError: backend error: sqlite_pipeline_db: disk full"
        );
    }
}
