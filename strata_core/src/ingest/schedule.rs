use crate::config::{to_chrono, PipelineConfig};
use crate::ingest::engine::IngestionEngine;
use crate::ingest::models::{DataSource, DueDecision, JobRun, JobRunStatus, JobTrigger};
use crate::storage::models::ListQuery;
use crate::storage::traits::SourceCatalog;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Everything the scheduler needs, resolved up front.
#[derive(Clone)]
pub struct SchedulerContext {
    pub engine: Arc<IngestionEngine>,
    pub catalog: Arc<dyn SourceCatalog>,
    pub poll_interval: Duration,
    pub default_interval: chrono::Duration,
    pub stale_after: chrono::Duration,
    pub workers: usize,
    pub queue_capacity: usize,
}

impl SchedulerContext {
    pub fn from_config(
        engine: Arc<IngestionEngine>,
        catalog: Arc<dyn SourceCatalog>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        Ok(Self {
            engine,
            catalog,
            poll_interval: config.poll_interval,
            default_interval: to_chrono(config.default_source_interval)?,
            stale_after: to_chrono(config.stale_after)?,
            workers: config.workers,
            queue_capacity: config.queue_capacity,
        })
    }
}

/// Counters from one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub examined: u64,
    pub dispatched: u64,
    pub skipped_active: u64,
    pub recovered_stale: u64,
    /// Sources held back because their last run failed on credentials.
    pub blocked_auth: u64,
    /// Pending runs older than one poll interval handed to the queue again.
    pub requeued: u64,
    /// Runs left pending because the worker queue was full.
    pub queue_full: u64,
    pub errors: u64,
}

/// Periodic discovery of due recurring sources, feeding a bounded worker pool.
///
/// Discovery never waits on execution: due runs are persisted as pending and
/// handed to workers with `try_send`.
pub struct Scheduler {
    ctx: SchedulerContext,
    queue: mpsc::Sender<JobRun>,
    receiver: Arc<Mutex<mpsc::Receiver<JobRun>>>,
}

/// Running scheduler tasks.
pub struct SchedulerHandle {
    ticker: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop discovery and workers. In-flight runs are abandoned and later
    /// recovered through lease expiry.
    pub fn shutdown(self) {
        self.ticker.abort();
        for w in self.workers {
            w.abort();
        }
        tracing::info!("scheduler stopped");
    }

    /// Wait for the ticker task (runs until aborted).
    pub async fn join(self) {
        let _ = self.ticker.await;
    }
}

impl Scheduler {
    #[tracing::instrument(level = "debug", skip(ctx))]
    pub fn new(ctx: SchedulerContext) -> Result<Self> {
        if ctx.poll_interval.is_zero() {
            return Err(Error::InvalidInput("poll_interval must be > 0".to_string()));
        }
        if ctx.workers == 0 {
            return Err(Error::InvalidInput("workers must be > 0".to_string()));
        }
        if ctx.queue_capacity == 0 {
            return Err(Error::InvalidInput("queue_capacity must be > 0".to_string()));
        }
        let (queue, receiver) = mpsc::channel(ctx.queue_capacity);
        Ok(Self {
            ctx,
            queue,
            receiver: Arc::new(Mutex::new(receiver)),
        })
    }

    /// Spawn the worker pool and the discovery ticker.
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let workers = (0..self.ctx.workers)
            .map(|worker| {
                let this = self.clone();
                tokio::spawn(async move { this.worker_loop(worker).await })
            })
            .collect();
        let this = self.clone();
        let ticker = tokio::spawn(async move { this.run_loop().await });
        tracing::info!(workers = self.ctx.workers, "scheduler started");
        SchedulerHandle { ticker, workers }
    }

    async fn run_loop(&self) {
        let mut ticker = tokio::time::interval(self.ctx.poll_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick(Utc::now()).await {
                tracing::warn!(error = %e, "ingestion scheduler tick failed");
            }
        }
    }

    async fn worker_loop(&self, worker: usize) {
        loop {
            let next = {
                let mut rx = self.receiver.lock().await;
                rx.recv().await
            };
            let Some(run) = next else {
                break;
            };
            let run_id = run.id;
            match self.ctx.engine.execute(run).await {
                Ok(done) => tracing::debug!(worker, job_run_id = %run_id, status = done.status.as_str(), "worker finished run"),
                Err(e) => tracing::warn!(worker, job_run_id = %run_id, error = %e, "worker could not record run"),
            }
        }
    }

    /// One discovery pass over every recurring source.
    ///
    /// Per-source failures are logged and counted; the pass always continues.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();
        let mut offset = 0usize;
        let limit = 200usize;
        loop {
            let batch = self
                .ctx
                .catalog
                .list_recurring_sources(ListQuery { limit, offset })
                .await?;
            if batch.is_empty() {
                break;
            }
            let fetched = batch.len();

            for source in batch {
                report.examined += 1;
                if let Err(e) = self.visit(&source, now, &mut report).await {
                    report.errors += 1;
                    tracing::warn!(
                        data_source_id = %source.id,
                        org_id = %source.organization_id,
                        error = %e,
                        "scheduler skipped source"
                    );
                }
            }

            if fetched < limit {
                break;
            }
            offset += limit;
        }
        tracing::info!(
            examined = report.examined,
            dispatched = report.dispatched,
            skipped_active = report.skipped_active,
            recovered_stale = report.recovered_stale,
            blocked_auth = report.blocked_auth,
            requeued = report.requeued,
            queue_full = report.queue_full,
            errors = report.errors,
            "scheduler tick finished"
        );
        Ok(report)
    }

    async fn visit(
        &self,
        source: &DataSource,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        let last = self
            .ctx
            .catalog
            .latest_job_run(source.organization_id, source.id)
            .await?;
        let decision = source.due_decision(
            now,
            last.as_ref(),
            self.ctx.default_interval,
            self.ctx.stale_after,
        );
        match decision {
            DueDecision::Active(_) => {
                report.skipped_active += 1;
                if let Some(run) = last {
                    self.requeue_if_waiting(run, now, report)?;
                }
                return Ok(());
            }
            DueDecision::BlockedOnAuth(run_id) => {
                report.blocked_auth += 1;
                tracing::debug!(data_source_id = %source.id, job_run_id = %run_id, "source blocked on credentials");
                return Ok(());
            }
            DueDecision::DueAfterStaleLease(_) => {
                if let Some(stale) = last {
                    if self.ctx.engine.expire_lease(stale, now).await? {
                        report.recovered_stale += 1;
                    }
                }
            }
            DueDecision::Due => {}
            DueDecision::NotRecurring | DueDecision::Disabled | DueDecision::NotYetDue { .. } => {
                return Ok(())
            }
        }

        let run = self
            .ctx
            .engine
            .dispatch(source, JobTrigger::Scheduled, now)
            .await?;
        report.dispatched += 1;
        if let Err(e) = self.queue.try_send(run) {
            // The pending run stays in the catalog and is retried once its lease expires.
            report.queue_full += 1;
            tracing::warn!(data_source_id = %source.id, error = %e, "worker queue full");
        }
        Ok(())
    }

    /// Resend a pending run that sat through a whole poll interval.
    /// Duplicate deliveries lose the claim in `execute`.
    fn requeue_if_waiting(
        &self,
        run: JobRun,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        if run.status != JobRunStatus::Pending
            || now - run.created_at < to_chrono(self.ctx.poll_interval)?
        {
            return Ok(());
        }
        match self.queue.try_send(run) {
            Ok(()) => report.requeued += 1,
            Err(_) => report.queue_full += 1,
        }
        Ok(())
    }
}
