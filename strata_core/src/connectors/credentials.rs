use crate::ingest::models::SourceKind;
use crate::models::OrgId;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// A per-tenant access credential for an external source.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// Credential lookup owned outside the pipeline.
///
/// `Ok(None)` means the organization has no credential; callers fail closed.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_credential(&self, org_id: OrgId, kind: SourceKind) -> Result<Option<Credential>>;
}

#[derive(Debug, Deserialize)]
struct CredentialEntry {
    organization_id: OrgId,
    kind: SourceKind,
    access_token: String,
}

/// Fixed credential table for development and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    creds: HashMap<(OrgId, SourceKind), Credential>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, org_id: OrgId, kind: SourceKind, access_token: impl Into<String>) -> Self {
        self.creds.insert(
            (org_id, kind),
            Credential {
                access_token: access_token.into(),
            },
        );
        self
    }

    /// Load `[{"organization_id", "kind", "access_token"}, ...]` from a JSON file.
    #[tracing::instrument(level = "debug")]
    pub async fn from_json_file(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::backend(format!("read credentials file {}", path.display()), e))?;
        let entries: Vec<CredentialEntry> = serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidInput(format!("invalid credentials file: {e}")))?;
        let mut out = Self::new();
        for entry in entries {
            if entry.access_token.trim().is_empty() {
                continue;
            }
            out = out.with(entry.organization_id, entry.kind, entry.access_token);
        }
        Ok(out)
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_credential(&self, org_id: OrgId, kind: SourceKind) -> Result<Option<Credential>> {
        Ok(self.creds.get(&(org_id, kind)).cloned())
    }
}
