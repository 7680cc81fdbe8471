use crate::connectors::RawRow;
use crate::models::{DataSourceId, JobRunId, OrgId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    pub limit: usize,
    pub offset: usize,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            limit: 200,
            offset: 0,
        }
    }
}

/// Raw record as landed in staging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedRow {
    /// Insertion sequence within the store; reads are ordered by it.
    pub seq: i64,
    pub job_run_id: JobRunId,
    pub organization_id: OrgId,
    pub raw_payload: RawRow,
    pub ingested_at: DateTime<Utc>,
}

/// Typed, deduplicated record ready for aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CuratedFact {
    pub organization_id: OrgId,
    pub data_source_id: DataSourceId,
    /// Unique per organization; see `CuratedFact::build_natural_key`.
    pub natural_key: String,
    pub record_key: String,
    pub period: NaiveDate,
    pub region: Option<String>,
    pub status: Option<String>,
    pub maturity_band: Option<String>,
    pub creditor_code: Option<String>,
    pub debtor: Option<String>,
    pub document: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub amount: f64,
    pub recovered_amount: Option<f64>,
    pub balance: Option<f64>,
    pub fee_amount: Option<f64>,
    pub contract_fee: Option<f64>,
    pub days_overdue: Option<i64>,
    pub source_job_run_id: JobRunId,
    pub curated_at: DateTime<Utc>,
}

impl CuratedFact {
    pub fn build_natural_key(
        data_source_id: DataSourceId,
        record_key: &str,
        period: NaiveDate,
        region: Option<&str>,
    ) -> String {
        format!(
            "{data_source_id}|{record_key}|{}|{}",
            period.format("%Y-%m-%d"),
            region.unwrap_or("")
        )
    }
}

/// Tenant-scoped read over curated facts. Every field narrows the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub region: Option<String>,
    pub status: Option<String>,
    pub creditor_code: Option<String>,
    pub data_source_id: Option<DataSourceId>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for FactQuery {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
            region: None,
            status: None,
            creditor_code: None,
            data_source_id: None,
            limit: 1000,
            offset: 0,
        }
    }
}

impl FactQuery {
    pub fn matches(&self, fact: &CuratedFact) -> bool {
        fn eq(filter: &Option<String>, value: &Option<String>) -> bool {
            filter
                .as_ref()
                .map(|f| value.as_deref() == Some(f.as_str()))
                .unwrap_or(true)
        }
        self.from.map(|d| fact.period >= d).unwrap_or(true)
            && self.to.map(|d| fact.period <= d).unwrap_or(true)
            && eq(&self.region, &fact.region)
            && eq(&self.status, &fact.status)
            && eq(&self.creditor_code, &fact.creditor_code)
            && self
                .data_source_id
                .map(|id| fact.data_source_id == id)
                .unwrap_or(true)
    }
}

/// The fixed aggregation statements the curated store can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateShape {
    /// sum(amount) per `YYYY-MM`, ascending by month.
    AmountByMonth,
    /// sum(amount) per region, descending by total.
    AmountByRegion,
    /// sum(amount) per days-past-due band of `due_date`, in band order.
    AmountByMaturityBand,
    /// sum(recovered_amount) per days-past-due band of `due_date`, in band order.
    RecoveredByMaturityBand,
}

impl AggregateShape {
    pub fn is_maturity_band(&self) -> bool {
        matches!(
            self,
            AggregateShape::AmountByMaturityBand | AggregateShape::RecoveredByMaturityBand
        )
    }
}

/// Bucket label used when the grouped dimension is null.
pub const UNSPECIFIED_BUCKET: &str = "unspecified";

/// Inclusive upper bound in days past due, and label, in presentation order.
/// Dates not yet due fall in the first band.
pub const MATURITY_BANDS: [(i64, &str); 6] = [
    (30, "0-30"),
    (60, "31-60"),
    (90, "61-90"),
    (180, "91-180"),
    (360, "181-360"),
    (720, "361-720"),
];

/// Label for anything past the last band.
pub const MATURITY_BAND_OVER: &str = "720+";

/// Band of a due date as seen on `as_of`. Missing dates are `unspecified`.
pub fn maturity_band(due_date: Option<NaiveDate>, as_of: NaiveDate) -> &'static str {
    let Some(due) = due_date else {
        return UNSPECIFIED_BUCKET;
    };
    let days_past_due = (as_of - due).num_days();
    MATURITY_BANDS
        .iter()
        .find(|(limit, _)| days_past_due <= *limit)
        .map(|(_, label)| *label)
        .unwrap_or(MATURITY_BAND_OVER)
}

/// Sort position of a band label; unknown labels go last.
pub fn maturity_band_rank(label: &str) -> usize {
    if let Some(pos) = MATURITY_BANDS.iter().position(|(_, l)| *l == label) {
        return pos;
    }
    match label {
        MATURITY_BAND_OVER => MATURITY_BANDS.len(),
        UNSPECIFIED_BUCKET => MATURITY_BANDS.len() + 1,
        _ => MATURITY_BANDS.len() + 2,
    }
}

/// Validated, bound parameters for one aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateQuery {
    pub shape: AggregateShape,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub region: Option<String>,
    pub status: Option<String>,
    pub creditor_code: Option<String>,
    /// Reference date for maturity bands.
    pub as_of: NaiveDate,
}

impl AggregateQuery {
    pub fn new(shape: AggregateShape) -> Self {
        Self {
            shape,
            from: None,
            to: None,
            region: None,
            status: None,
            creditor_code: None,
            as_of: Utc::now().date_naive(),
        }
    }

    pub fn as_fact_query(&self) -> FactQuery {
        FactQuery {
            from: self.from,
            to: self.to,
            region: self.region.clone(),
            status: self.status.clone(),
            creditor_code: self.creditor_code.clone(),
            ..FactQuery::default()
        }
    }
}

/// One result row of an indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRow {
    pub bucket: String,
    pub total: f64,
    pub fact_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn maturity_band_counts_days_past_due() {
        let as_of = day(2024, 6, 30);
        assert_eq!(maturity_band(None, as_of), "unspecified");
        assert_eq!(maturity_band(Some(day(2024, 8, 1)), as_of), "0-30");
        assert_eq!(maturity_band(Some(day(2024, 5, 31)), as_of), "0-30");
        assert_eq!(maturity_band(Some(day(2024, 5, 30)), as_of), "31-60");
        assert_eq!(maturity_band(Some(day(2024, 4, 1)), as_of), "61-90");
        assert_eq!(maturity_band(Some(day(2024, 1, 1)), as_of), "181-360");
        assert_eq!(maturity_band(Some(day(2022, 7, 12)), as_of), "361-720");
        assert_eq!(maturity_band(Some(day(2020, 1, 1)), as_of), "720+");
    }

    #[test]
    fn maturity_bands_sort_in_fixed_order() {
        let mut labels = vec!["unspecified", "720+", "31-60", "0-30", "361-720"];
        labels.sort_by_key(|l| maturity_band_rank(l));
        assert_eq!(labels, vec!["0-30", "31-60", "361-720", "720+", "unspecified"]);
    }
}
