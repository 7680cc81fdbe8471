//! Named, fixed-shape aggregations over curated facts.
//!
//! Every indicator is bound to one `AggregateShape` at construction. Caller
//! input only ever becomes bound parameters; the set of executable statements
//! never depends on a request.

use crate::models::OrgId;
use crate::storage::models::{AggregateQuery, AggregateShape};
use crate::storage::traits::CuratedStore;
use crate::{Error, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub use crate::storage::models::IndicatorRow;

/// A dimension an indicator may be filtered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorFilter {
    Region,
    Status,
    CreditorCode,
}

impl IndicatorFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorFilter::Region => "region",
            IndicatorFilter::Status => "status",
            IndicatorFilter::CreditorCode => "creditor_code",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "region" => Some(IndicatorFilter::Region),
            "status" => Some(IndicatorFilter::Status),
            "creditor_code" => Some(IndicatorFilter::CreditorCode),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorDef {
    pub name: &'static str,
    pub description: &'static str,
    pub shape: AggregateShape,
    pub allowed_filters: &'static [IndicatorFilter],
}

const BUILTIN: &[IndicatorDef] = &[
    IndicatorDef {
        name: "value_by_month",
        description: "Sum of amount per month of period",
        shape: AggregateShape::AmountByMonth,
        allowed_filters: &[
            IndicatorFilter::Region,
            IndicatorFilter::Status,
            IndicatorFilter::CreditorCode,
        ],
    },
    IndicatorDef {
        name: "value_by_region",
        description: "Sum of amount per region, largest first",
        shape: AggregateShape::AmountByRegion,
        allowed_filters: &[IndicatorFilter::Status, IndicatorFilter::CreditorCode],
    },
    IndicatorDef {
        name: "value_by_maturity_band",
        description: "Sum of amount per days-past-due band of due_date, as of 'to' or today",
        shape: AggregateShape::AmountByMaturityBand,
        allowed_filters: &[IndicatorFilter::Region, IndicatorFilter::CreditorCode],
    },
    IndicatorDef {
        name: "recovered_by_maturity_band",
        description: "Sum of recovered amount per days-past-due band of due_date, as of 'to' or today",
        shape: AggregateShape::RecoveredByMaturityBand,
        allowed_filters: &[IndicatorFilter::Region, IndicatorFilter::CreditorCode],
    },
];

/// Caller-supplied parameters, unvalidated against any particular indicator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorParams {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
}

impl IndicatorParams {
    /// Build from loose string pairs. Dates must be `YYYY-MM-DD`.
    pub fn parse<I, K, V>(from: Option<&str>, to: Option<&str>, filters: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Ok(Self {
            from: from.map(|s| parse_date("from", s)).transpose()?,
            to: to.map(|s| parse_date("to", s)).transpose()?,
            filters: filters
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        })
    }
}

fn parse_date(param: &str, raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| Error::InvalidParam(format!("'{param}' must be YYYY-MM-DD, got '{raw}'")))
}

pub struct IndicatorEngine {
    curated: Arc<dyn CuratedStore>,
    registry: BTreeMap<&'static str, IndicatorDef>,
}

impl IndicatorEngine {
    pub fn new(curated: Arc<dyn CuratedStore>) -> Self {
        Self {
            curated,
            registry: BUILTIN.iter().map(|d| (d.name, d.clone())).collect(),
        }
    }

    pub fn list(&self) -> Vec<IndicatorDef> {
        self.registry.values().cloned().collect()
    }

    /// Resolve and validate without touching storage.
    pub fn prepare(&self, name: &str, params: &IndicatorParams) -> Result<AggregateQuery> {
        let def = self
            .registry
            .get(name)
            .ok_or_else(|| Error::UnknownIndicator(name.to_string()))?;

        if let (Some(from), Some(to)) = (params.from, params.to) {
            if from > to {
                return Err(Error::InvalidParam(format!(
                    "'from' ({from}) is after 'to' ({to})"
                )));
            }
        }

        let mut query = AggregateQuery::new(def.shape);
        query.from = params.from;
        query.to = params.to;
        if let Some(to) = params.to {
            query.as_of = to;
        }
        for (key, value) in &params.filters {
            let filter = IndicatorFilter::parse_str(key)
                .filter(|f| def.allowed_filters.contains(f))
                .ok_or_else(|| {
                    Error::InvalidParam(format!("indicator '{name}' has no filter '{key}'"))
                })?;
            let value = value.trim();
            if value.is_empty() {
                return Err(Error::InvalidParam(format!("filter '{key}' is empty")));
            }
            let slot = match filter {
                IndicatorFilter::Region => &mut query.region,
                IndicatorFilter::Status => &mut query.status,
                IndicatorFilter::CreditorCode => &mut query.creditor_code,
            };
            *slot = Some(match filter {
                IndicatorFilter::Region => value.to_uppercase(),
                _ => value.to_string(),
            });
        }
        Ok(query)
    }

    /// Run an indicator for one organization. No matching data yields no rows.
    #[tracing::instrument(level = "info", skip(self, params), fields(org_id = %org_id))]
    pub async fn run(
        &self,
        name: &str,
        org_id: OrgId,
        params: &IndicatorParams,
    ) -> Result<Vec<IndicatorRow>> {
        let query = self.prepare(name, params)?;
        let rows = self.curated.aggregate(org_id, &query).await?;
        tracing::debug!(rows = rows.len(), "indicator evaluated");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::{CuratedFact, FactQuery};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CuratedStore for CountingStore {
        async fn upsert_facts(&self, _: OrgId, _: &[CuratedFact]) -> Result<u64> {
            unreachable!()
        }
        async fn query_facts(&self, _: OrgId, _: &FactQuery) -> Result<Vec<CuratedFact>> {
            unreachable!()
        }
        async fn count_facts(&self, _: OrgId) -> Result<u64> {
            unreachable!()
        }
        async fn aggregate(&self, _: OrgId, _: &AggregateQuery) -> Result<Vec<IndicatorRow>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    fn engine() -> (Arc<CountingStore>, IndicatorEngine) {
        let store = Arc::new(CountingStore::default());
        (store.clone(), IndicatorEngine::new(store))
    }

    #[tokio::test]
    async fn rejects_before_touching_the_store() {
        let (store, engine) = engine();
        let org = OrgId::new();

        let err = engine
            .run("drop_table", org, &IndicatorParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownIndicator(_)));

        let inverted = IndicatorParams::parse(Some("2024-05-01"), Some("2024-01-01"), Vec::<(String, String)>::new()).unwrap();
        let err = engine.run("value_by_month", org, &inverted).await.unwrap_err();
        assert!(matches!(err, Error::InvalidParam(_)));

        let bad_filter = IndicatorParams::parse(None, None, [("region", "SP")]).unwrap();
        let err = engine.run("value_by_region", org, &bad_filter).await.unwrap_err();
        assert!(matches!(err, Error::InvalidParam(_)));

        let injected = IndicatorParams::parse(None, None, [("region; --", "x")]).unwrap();
        assert!(engine.run("value_by_month", org, &injected).await.is_err());

        let empty = IndicatorParams::parse(None, None, [("status", "  ")]).unwrap();
        assert!(engine.run("value_by_month", org, &empty).await.is_err());

        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn valid_params_reach_the_store() {
        let (store, engine) = engine();
        let params = IndicatorParams::parse(
            Some("2024-01-01"),
            Some("2024-01-01"),
            [("region", "sp"), ("creditor_code", "C1")],
        )
        .unwrap();
        let query = engine.prepare("value_by_month", &params).unwrap();
        assert_eq!(query.shape, AggregateShape::AmountByMonth);
        assert_eq!(query.region.as_deref(), Some("SP"));
        assert_eq!(query.creditor_code.as_deref(), Some("C1"));

        let rows = engine.run("value_by_month", OrgId::new(), &params).await.unwrap();
        assert!(rows.is_empty());
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn maturity_bands_are_anchored_on_to() {
        let (_, engine) = engine();
        let params = IndicatorParams::parse(None, Some("2024-06-30"), [("region", "rj")]).unwrap();
        let query = engine.prepare("recovered_by_maturity_band", &params).unwrap();
        assert_eq!(query.shape, AggregateShape::RecoveredByMaturityBand);
        assert_eq!(query.as_of, NaiveDate::from_ymd_opt(2024, 6, 30).unwrap());

        let err = engine
            .prepare(
                "value_by_maturity_band",
                &IndicatorParams::parse(None, None, [("status", "open")]).unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParam(_)));
    }

    #[test]
    fn parse_rejects_malformed_dates() {
        let err = IndicatorParams::parse(Some("01/02/2024"), None, Vec::<(String, String)>::new()).unwrap_err();
        assert_eq!(err.code(), "InvalidParam");
    }

    #[test]
    fn registry_lists_shipped_indicators() {
        let (_, engine) = engine();
        let names: Vec<_> = engine.list().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec![
                "recovered_by_maturity_band",
                "value_by_maturity_band",
                "value_by_month",
                "value_by_region"
            ]
        );
    }
}
