use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::connectors::RawRow;
use crate::ingest::models::{DataSource, JobRun, JobRunQuery, JobRunStatus};
use crate::models::{DataSourceId, JobRunId, OrgId, Organization};
use crate::storage::models::{
    maturity_band, maturity_band_rank, AggregateQuery, AggregateShape, CuratedFact, FactQuery,
    IndicatorRow, ListQuery, StagedRow, UNSPECIFIED_BUCKET,
};
use crate::storage::traits::{
    ensure_facts_org, CuratedStore, SourceCatalog, StagedRowStream, StagingStore,
};
use crate::{Error, Result};

#[derive(Default)]
struct State {
    orgs: HashMap<OrgId, Organization>,
    sources: BTreeMap<DataSourceId, DataSource>,
    runs: Vec<JobRun>,
    staged: Vec<StagedRow>,
    next_seq: i64,
    facts: HashMap<(OrgId, String), CuratedFact>,
}

/// In-memory pipeline storage for tests and dry runs.
///
/// Implements the same tenant scoping and run-exclusivity rules as the SQLite
/// backend; contents live for the process lifetime only.
#[derive(Clone, Default)]
pub struct MemoryPipelineDb {
    state: Arc<Mutex<State>>,
}

impl MemoryPipelineDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every staged row (primarily for tests).
    pub async fn all_staged(&self) -> Vec<StagedRow> {
        self.state.lock().await.staged.clone()
    }
}

#[async_trait]
impl SourceCatalog for MemoryPipelineDb {
    async fn upsert_organization(&self, org: &Organization) -> Result<()> {
        let mut state = self.state.lock().await;
        if state
            .orgs
            .values()
            .any(|o| o.slug == org.slug && o.id != org.id)
        {
            return Err(Error::Conflict(format!("slug '{}' already taken", org.slug)));
        }
        state.orgs.insert(org.id, org.clone());
        Ok(())
    }

    async fn get_organization(&self, org_id: OrgId) -> Result<Option<Organization>> {
        Ok(self.state.lock().await.orgs.get(&org_id).cloned())
    }

    async fn get_organization_by_slug(&self, slug: &str) -> Result<Option<Organization>> {
        let state = self.state.lock().await;
        Ok(state.orgs.values().find(|o| o.slug == slug).cloned())
    }

    async fn upsert_data_source(&self, source: &DataSource) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.sources.get(&source.id) {
            if existing.organization_id != source.organization_id {
                return Err(Error::Unauthorized(
                    "data source belongs to a different organization".to_string(),
                ));
            }
        }
        state.sources.insert(source.id, source.clone());
        Ok(())
    }

    async fn get_data_source(
        &self,
        org_id: OrgId,
        data_source_id: DataSourceId,
    ) -> Result<Option<DataSource>> {
        let state = self.state.lock().await;
        Ok(state
            .sources
            .get(&data_source_id)
            .filter(|s| s.organization_id == org_id)
            .cloned())
    }

    async fn list_data_sources(&self, org_id: OrgId, query: ListQuery) -> Result<Vec<DataSource>> {
        let state = self.state.lock().await;
        let mut out: Vec<DataSource> = state
            .sources
            .values()
            .filter(|s| s.organization_id == org_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out.into_iter().skip(query.offset).take(query.limit).collect())
    }

    async fn list_recurring_sources(&self, query: ListQuery) -> Result<Vec<DataSource>> {
        let state = self.state.lock().await;
        let mut out: Vec<DataSource> = state
            .sources
            .values()
            .filter(|s| s.is_recurring && s.enabled)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out.into_iter().skip(query.offset).take(query.limit).collect())
    }

    async fn insert_job_run(&self, run: &JobRun) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.runs.iter().any(|r| r.id == run.id) {
            return Err(Error::Conflict(format!("job run {} already exists", run.id)));
        }
        if let Some(active) = state
            .runs
            .iter()
            .find(|r| r.data_source_id == run.data_source_id && !r.status.is_terminal())
        {
            return Err(Error::Conflict(format!(
                "data source {} already has active run {}",
                run.data_source_id, active.id
            )));
        }
        state.runs.push(run.clone());
        Ok(())
    }

    async fn transition_job_run(&self, run: &JobRun, expected: JobRunStatus) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(stored) = state
            .runs
            .iter_mut()
            .find(|r| r.id == run.id && r.organization_id == run.organization_id)
        else {
            return Err(Error::NotFound(format!("job run {}", run.id)));
        };
        if stored.status != expected {
            return Ok(false);
        }
        *stored = run.clone();
        Ok(true)
    }

    async fn get_job_run(&self, org_id: OrgId, job_run_id: JobRunId) -> Result<Option<JobRun>> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .find(|r| r.id == job_run_id && r.organization_id == org_id)
            .cloned())
    }

    async fn latest_job_run(
        &self,
        org_id: OrgId,
        data_source_id: DataSourceId,
    ) -> Result<Option<JobRun>> {
        let state = self.state.lock().await;
        // Ties on created_at go to the most recently inserted run.
        Ok(state
            .runs
            .iter()
            .enumerate()
            .filter(|(_, r)| r.organization_id == org_id && r.data_source_id == data_source_id)
            .max_by_key(|(idx, r)| (r.created_at, *idx))
            .map(|(_, r)| r.clone()))
    }

    async fn list_job_runs(&self, org_id: OrgId, query: JobRunQuery) -> Result<Vec<JobRun>> {
        let state = self.state.lock().await;
        let mut out: Vec<JobRun> = state
            .runs
            .iter()
            .rev()
            .filter(|r| r.organization_id == org_id)
            .filter(|r| {
                query
                    .data_source_id
                    .map(|id| r.data_source_id == id)
                    .unwrap_or(true)
            })
            .filter(|r| query.status.map(|s| r.status == s).unwrap_or(true))
            .filter(|r| query.since.map(|t| r.created_at >= t).unwrap_or(true))
            .filter(|r| query.until.map(|t| r.created_at <= t).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out.into_iter().skip(query.offset).take(query.limit).collect())
    }
}

#[async_trait]
impl StagingStore for MemoryPipelineDb {
    async fn append(&self, org_id: OrgId, job_run_id: JobRunId, rows: &[RawRow]) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        for row in rows {
            state.next_seq += 1;
            let seq = state.next_seq;
            state.staged.push(StagedRow {
                seq,
                job_run_id,
                organization_id: org_id,
                raw_payload: row.clone(),
                ingested_at: now,
            });
        }
        Ok(rows.len() as u64)
    }

    fn read_by_run(&self, org_id: OrgId, job_run_id: JobRunId) -> StagedRowStream {
        let state = self.state.clone();
        Box::pin(async_stream::stream! {
            let rows: Vec<StagedRow> = state
                .lock()
                .await
                .staged
                .iter()
                .filter(|r| r.organization_id == org_id && r.job_run_id == job_run_id)
                .cloned()
                .collect();
            for row in rows {
                yield Ok::<StagedRow, Error>(row);
            }
        })
    }

    async fn count_by_run(&self, org_id: OrgId, job_run_id: JobRunId) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .staged
            .iter()
            .filter(|r| r.organization_id == org_id && r.job_run_id == job_run_id)
            .count() as u64)
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.staged.len();
        state.staged.retain(|r| r.ingested_at >= cutoff);
        Ok((before - state.staged.len()) as u64)
    }
}

#[async_trait]
impl CuratedStore for MemoryPipelineDb {
    async fn upsert_facts(&self, org_id: OrgId, facts: &[CuratedFact]) -> Result<u64> {
        ensure_facts_org(org_id, facts)?;
        let mut state = self.state.lock().await;
        for fact in facts {
            state
                .facts
                .insert((org_id, fact.natural_key.clone()), fact.clone());
        }
        Ok(facts.len() as u64)
    }

    async fn query_facts(&self, org_id: OrgId, query: &FactQuery) -> Result<Vec<CuratedFact>> {
        let state = self.state.lock().await;
        let mut out: Vec<CuratedFact> = state
            .facts
            .iter()
            .filter(|((org, _), f)| *org == org_id && query.matches(f))
            .map(|(_, f)| f.clone())
            .collect();
        out.sort_by(|a, b| {
            a.period
                .cmp(&b.period)
                .then_with(|| a.natural_key.cmp(&b.natural_key))
        });
        Ok(out.into_iter().skip(query.offset).take(query.limit).collect())
    }

    async fn count_facts(&self, org_id: OrgId) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state.facts.keys().filter(|(org, _)| *org == org_id).count() as u64)
    }

    async fn aggregate(&self, org_id: OrgId, query: &AggregateQuery) -> Result<Vec<IndicatorRow>> {
        let filter = query.as_fact_query();
        let state = self.state.lock().await;
        let facts = state
            .facts
            .iter()
            .filter(|((org, _), f)| *org == org_id && filter.matches(f))
            .map(|(_, f)| f);
        Ok(aggregate_facts(query, facts))
    }
}

fn aggregate_facts<'a>(
    query: &AggregateQuery,
    facts: impl Iterator<Item = &'a CuratedFact>,
) -> Vec<IndicatorRow> {
    let shape = query.shape;
    let mut buckets: BTreeMap<String, (f64, u64)> = BTreeMap::new();
    for fact in facts {
        let (bucket, value) = match shape {
            AggregateShape::AmountByMonth => (fact.period.format("%Y-%m").to_string(), fact.amount),
            AggregateShape::AmountByRegion => (
                fact.region.clone().unwrap_or_else(|| UNSPECIFIED_BUCKET.to_string()),
                fact.amount,
            ),
            AggregateShape::AmountByMaturityBand => (
                maturity_band(fact.due_date, query.as_of).to_string(),
                fact.amount,
            ),
            AggregateShape::RecoveredByMaturityBand => (
                maturity_band(fact.due_date, query.as_of).to_string(),
                fact.recovered_amount.unwrap_or(0.0),
            ),
        };
        let entry = buckets.entry(bucket).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }

    let mut rows: Vec<IndicatorRow> = buckets
        .into_iter()
        .map(|(bucket, (total, fact_count))| IndicatorRow {
            bucket,
            total,
            fact_count,
        })
        .collect();
    match shape {
        AggregateShape::AmountByMonth => {}
        AggregateShape::AmountByRegion => {
            rows.sort_by(|a, b| {
                b.total
                    .total_cmp(&a.total)
                    .then_with(|| a.bucket.cmp(&b.bucket))
            });
        }
        AggregateShape::AmountByMaturityBand | AggregateShape::RecoveredByMaturityBand => {
            rows.sort_by_key(|r| maturity_band_rank(&r.bucket));
        }
    }
    rows
}
