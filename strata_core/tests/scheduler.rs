// Scheduler discovery against the SQLite catalog.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use strata_core::ingest::traits::{IngestionDeps, IngestionService};
use strata_core::{
    Connector, DataSource, Error, IngestionEngine, JobRun, JobRunQuery, JobRunStatus, JobTrigger,
    OrgId, PipelineConfig, Result, RowStream, Scheduler, SchedulerContext, SourceCatalog,
    SourceConfig, SourceKind, SqlitePipelineDb,
};

struct OneRowSheets;

#[async_trait]
impl Connector for OneRowSheets {
    fn kind(&self) -> SourceKind {
        SourceKind::GoogleSheets
    }

    async fn fetch(&self, _org_id: OrgId, _source: &DataSource) -> Result<RowStream> {
        let row = serde_json::json!({"Data Cadastro": "2024-03-01", "Valor Título": "50,00"})
            .as_object()
            .cloned()
            .unwrap_or_default();
        Ok(Box::pin(futures_util::stream::iter(vec![Ok(row)])))
    }
}

async fn setup() -> (
    tempfile::TempDir,
    Arc<SqlitePipelineDb>,
    Arc<IngestionEngine>,
    Scheduler,
    DataSource,
) {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        data_dir: dir.path().to_path_buf(),
        ..PipelineConfig::default()
    };
    let db = Arc::new(SqlitePipelineDb::new(config.database_path()).await.unwrap());
    let engine = Arc::new(IngestionEngine::new(IngestionDeps::shared(db.clone()), &config).unwrap());
    engine.register_connector(Arc::new(OneRowSheets)).await.unwrap();

    let org = engine.create_organization("acme", "Acme").await.unwrap();
    let source = engine
        .register_source(
            DataSource::new(
                org.id,
                "carteira",
                SourceConfig::GoogleSheets {
                    spreadsheet_id: "sheet-1".to_string(),
                    range: "A1:Z".to_string(),
                    creditor_code: None,
                },
                true,
                Some(30),
                None,
            )
            .unwrap(),
        )
        .await
        .unwrap();

    let ctx = SchedulerContext::from_config(engine.clone(), db.clone(), &config).unwrap();
    let scheduler = Scheduler::new(ctx).unwrap();
    (dir, db, engine, scheduler, source)
}

#[tokio::test]
async fn catalog_rejects_a_second_active_run() {
    let (_dir, db, engine, _scheduler, source) = setup().await;
    engine
        .dispatch(&source, JobTrigger::Scheduled, Utc::now())
        .await
        .unwrap();
    let err = engine
        .dispatch(&source, JobTrigger::OnDemand, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    let active = db
        .list_job_runs(
            source.organization_id,
            JobRunQuery {
                status: Some(JobRunStatus::Pending),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn tick_skips_active_then_recovers_stale_lease() {
    let (_dir, db, engine, scheduler, source) = setup().await;
    let t0 = Utc::now();

    let first = scheduler.tick(t0).await.unwrap();
    assert_eq!(first.dispatched, 1);

    let second = scheduler.tick(t0 + ChronoDuration::minutes(45)).await.unwrap();
    assert_eq!(second.dispatched, 0);
    assert_eq!(second.skipped_active, 1);

    let third = scheduler.tick(t0 + ChronoDuration::hours(4)).await.unwrap();
    assert_eq!(third.recovered_stale, 1);
    assert_eq!(third.dispatched, 1);

    let latest = db
        .latest_job_run(source.organization_id, source.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.status, JobRunStatus::Pending);

    // A worker picking up the fresh run completes it normally.
    let done = engine.execute(latest).await.unwrap();
    assert_eq!(done.status, JobRunStatus::Succeeded);
    assert_eq!(done.rows_transformed, 1);

    let history = engine
        .list_job_runs(source.organization_id, Default::default())
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(history
        .iter()
        .any(|r| r.status == JobRunStatus::Failed
            && r.error_detail.as_deref().unwrap_or("").starts_with("LeaseExpired")));
}

#[tokio::test]
async fn disabled_sources_are_not_dispatched() {
    let (_dir, _db, engine, scheduler, source) = setup().await;
    engine
        .disable_source(source.organization_id, source.id)
        .await
        .unwrap();
    let report = scheduler.tick(Utc::now()).await.unwrap();
    assert_eq!(report.dispatched, 0);
}

struct UnreachableSql;

#[async_trait]
impl Connector for UnreachableSql {
    fn kind(&self) -> SourceKind {
        SourceKind::Sql
    }

    async fn fetch(&self, _org_id: OrgId, _source: &DataSource) -> Result<RowStream> {
        Err(Error::Connection("connection refused".to_string()))
    }
}

#[tokio::test]
async fn one_failing_source_does_not_hold_back_others() {
    let (_dir, db, engine, scheduler, healthy) = setup().await;
    engine.register_connector(Arc::new(UnreachableSql)).await.unwrap();
    let org = healthy.organization_id;
    let now = Utc::now();

    let register = |name: &str, config: SourceConfig| {
        let engine = engine.clone();
        let source = DataSource::new(org, name.to_string(), config, true, Some(30), None).unwrap();
        async move { engine.register_source(source).await.unwrap() }
    };
    let warehouse = register(
        "warehouse",
        SourceConfig::Sql {
            connection_url: "sqlite::memory:".to_string(),
            query: "select * from titulos".to_string(),
            creditor_code: None,
        },
    )
    .await;
    let broken = register(
        "broken",
        SourceConfig::GoogleSheets {
            spreadsheet_id: "sheet-2".to_string(),
            range: "A1:Z".to_string(),
            creditor_code: None,
        },
    )
    .await;

    // A finished run that sorts after a still-active one: discovery sees the
    // source as due, and dispatch then trips the one-active-run index.
    let mut finished =
        JobRun::new_pending(&broken, JobTrigger::Scheduled, now - ChronoDuration::hours(1));
    finished.mark_running(now - ChronoDuration::hours(1)).unwrap();
    finished
        .mark_failed(now - ChronoDuration::minutes(59), &Error::Connection("reset".to_string()))
        .unwrap();
    db.insert_job_run(&finished).await.unwrap();
    let stuck =
        JobRun::new_pending(&broken, JobTrigger::Scheduled, now - ChronoDuration::hours(2));
    db.insert_job_run(&stuck).await.unwrap();

    let report = scheduler.tick(now).await.unwrap();
    assert_eq!(report.examined, 3);
    assert_eq!(report.dispatched, 2);
    assert_eq!(report.errors, 1);

    for source in [&healthy, &warehouse] {
        let run = db.latest_job_run(org, source.id).await.unwrap().unwrap();
        assert_eq!(run.status, JobRunStatus::Pending);
        engine.execute(run).await.unwrap();
    }
    let ok = db.latest_job_run(org, healthy.id).await.unwrap().unwrap();
    assert_eq!(ok.status, JobRunStatus::Succeeded);
    let refused = db.latest_job_run(org, warehouse.id).await.unwrap().unwrap();
    assert_eq!(refused.status, JobRunStatus::Failed);
    assert!(refused
        .error_detail
        .as_deref()
        .unwrap_or("")
        .starts_with("ConnectionError"));

    // Connection failures come back on the next interval; the broken source keeps failing alone.
    let next = scheduler.tick(now + ChronoDuration::minutes(31)).await.unwrap();
    assert_eq!(next.dispatched, 2);
    assert_eq!(next.errors, 1);
}
