use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid uuid: {0}")]
    InvalidUuid(String),
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let id = Uuid::parse_str(s).map_err(|_| IdParseError::InvalidUuid(s.to_string()))?;
                Ok(Self(id))
            }
        }
    };
}

uuid_id!(
    /// Tenant identifier. Every stored row carries exactly one.
    OrgId
);
uuid_id!(
    /// Configured ingestion origin.
    DataSourceId
);
uuid_id!(
    /// One execution attempt of a data source.
    JobRunId
);

/// Tenant boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrgId,
    pub slug: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Organization {
    #[tracing::instrument(level = "debug")]
    pub fn new(
        slug: impl Into<String> + fmt::Debug,
        name: impl Into<String> + fmt::Debug,
        now: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let slug = slug.into().trim().to_lowercase();
        validate_slug(&slug)?;
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("organization name is empty".to_string()));
        }
        Ok(Self {
            id: OrgId::new(),
            slug,
            name,
            created_at: now.unwrap_or_else(Utc::now),
        })
    }
}

fn validate_slug(slug: &str) -> Result<()> {
    if !(2..=100).contains(&slug.len()) {
        return Err(Error::InvalidInput(
            "organization slug must be 2..=100 characters".to_string(),
        ));
    }
    let valid = slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid || slug.starts_with('-') || slug.ends_with('-') {
        return Err(Error::InvalidInput(format!(
            "organization slug '{slug}' must be lowercase alphanumeric with inner '-'"
        )));
    }
    Ok(())
}

/// Ensure a record belongs to the organization a call is scoped to.
pub fn ensure_same_org(expected: OrgId, actual: OrgId, what: &str) -> Result<()> {
    if expected != actual {
        return Err(Error::Unauthorized(format!(
            "{what} belongs to a different organization"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_is_normalized_and_validated() {
        let org = Organization::new("  Acme-Cobranca ", "Acme", None).unwrap();
        assert_eq!(org.slug, "acme-cobranca");

        assert!(Organization::new("a", "x", None).is_err());
        assert!(Organization::new("-acme", "x", None).is_err());
        assert!(Organization::new("ac me", "x", None).is_err());
        assert!(Organization::new("acme", " ", None).is_err());
    }

    #[test]
    fn ids_round_trip_through_strings() {
        let id = DataSourceId::new();
        let parsed: DataSourceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("nope".parse::<OrgId>().is_err());
    }

    #[test]
    fn cross_org_access_is_unauthorized() {
        let a = OrgId::new();
        let b = OrgId::new();
        assert!(ensure_same_org(a, a, "source").is_ok());
        assert!(matches!(
            ensure_same_org(a, b, "source"),
            Err(Error::Unauthorized(_))
        ));
    }
}
