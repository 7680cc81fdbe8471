// End-to-end pipeline tests against the SQLite backend.
// Run with: cargo test -p strata_core --test pipeline

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use strata_core::connectors::{default_connectors, StaticCredentials};
use strata_core::ingest::traits::{IngestionDeps, IngestionService};
use strata_core::{
    CuratedStore, DataSource, Error, FileFormat, IndicatorEngine, IndicatorParams,
    IngestionEngine, JobRunStatus, Organization, PipelineConfig, SourceConfig, SqlitePipelineDb,
    StagingStore,
};
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    dir_path: std::path::PathBuf,
    db: Arc<SqlitePipelineDb>,
    engine: IngestionEngine,
    indicators: IndicatorEngine,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        data_dir: dir.path().to_path_buf(),
        staging_batch_size: 64,
        sql_connect_timeout: Duration::from_secs(5),
        http_timeout: Duration::from_secs(2),
        // Unroutable; only the fail-closed credential path is exercised.
        sheets_api_base: "http://127.0.0.1:9".to_string(),
        ..PipelineConfig::default()
    };
    let db = Arc::new(SqlitePipelineDb::new(config.database_path()).await.unwrap());
    let engine = IngestionEngine::new(IngestionDeps::shared(db.clone()), &config).unwrap();
    for connector in default_connectors(&config, Arc::new(StaticCredentials::new())).unwrap() {
        engine.register_connector(connector).await.unwrap();
    }
    Harness {
        dir_path: dir.path().to_path_buf(),
        _dir: dir,
        indicators: IndicatorEngine::new(db.clone()),
        db,
        engine,
    }
}

async fn seed_source_db(path: &Path, rows: usize) {
    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await
        .unwrap();
    sqlx::query(
        "CREATE TABLE titulos (processo TEXT, dt_cadastro TEXT, vl_titulo REAL, uf TEXT, situacao TEXT)",
    )
    .execute(&pool)
    .await
    .unwrap();
    let mut tx = pool.begin().await.unwrap();
    for i in 0..rows {
        sqlx::query("INSERT INTO titulos VALUES (?1, ?2, ?3, ?4, ?5)")
            .bind(format!("P{i:04}"))
            .bind(format!("2024-0{}-15", i % 3 + 1))
            .bind(100.5)
            .bind(if i % 2 == 0 { "sp" } else { "RJ" })
            .bind("Ativo")
            .execute(&mut *tx)
            .await
            .unwrap();
    }
    tx.commit().await.unwrap();
    pool.close().await;
}

async fn sql_source(h: &Harness, org: &Organization, rows: usize) -> DataSource {
    let path = h.dir_path.join(format!("{}-source.db", org.slug));
    seed_source_db(&path, rows).await;
    let source = DataSource::new(
        org.id,
        "warehouse",
        SourceConfig::Sql {
            connection_url: format!("sqlite://{}", path.display()),
            query: "SELECT processo, dt_cadastro, vl_titulo, uf, situacao FROM titulos;".to_string(),
            creditor_code: Some("C01".to_string()),
        },
        false,
        None,
        None,
    )
    .unwrap();
    h.engine.register_source(source).await.unwrap()
}

#[tokio::test]
async fn sql_source_flows_to_indicators() {
    let h = harness().await;
    let org = h.engine.create_organization("acme", "Acme").await.unwrap();
    let source = sql_source(&h, &org, 500).await;

    let run = h.engine.trigger_ingestion(org.id, source.id).await.unwrap();
    assert_eq!(run.status, JobRunStatus::Succeeded, "{:?}", run.error_detail);
    assert_eq!(run.rows_staged, 500);
    assert_eq!(run.rows_transformed, 500);
    assert_eq!(run.rows_rejected, 0);
    assert_eq!(h.db.count_by_run(org.id, run.id).await.unwrap(), 500);
    assert_eq!(h.db.count_facts(org.id).await.unwrap(), 500);

    let by_month = h
        .indicators
        .run("value_by_month", org.id, &IndicatorParams::default())
        .await
        .unwrap();
    let buckets: Vec<_> = by_month.iter().map(|r| r.bucket.as_str()).collect();
    assert_eq!(buckets, vec!["2024-01", "2024-02", "2024-03"]);
    assert_eq!(by_month.iter().map(|r| r.fact_count).sum::<u64>(), 500);

    let params = IndicatorParams::parse(
        Some("2024-01-01"),
        Some("2024-01-31"),
        [("region", "SP"), ("creditor_code", "C01")],
    )
    .unwrap();
    let january_sp = h
        .indicators
        .run("value_by_month", org.id, &params)
        .await
        .unwrap();
    assert_eq!(january_sp.len(), 1);
    // i % 3 == 0 and i % 2 == 0 for i in 0..500.
    assert_eq!(january_sp[0].fact_count, 84);
    assert!((january_sp[0].total - 84.0 * 100.5).abs() < 1e-6);

    let by_region = h
        .indicators
        .run("value_by_region", org.id, &IndicatorParams::default())
        .await
        .unwrap();
    let regions: Vec<_> = by_region.iter().map(|r| r.bucket.as_str()).collect();
    assert_eq!(regions, vec!["RJ", "SP"]);
}

#[tokio::test]
async fn re_ingestion_is_idempotent() {
    let h = harness().await;
    let org = h.engine.create_organization("acme", "Acme").await.unwrap();
    let source = sql_source(&h, &org, 120).await;

    let first = h.engine.trigger_ingestion(org.id, source.id).await.unwrap();
    let second = h.engine.trigger_ingestion(org.id, source.id).await.unwrap();
    assert_eq!(first.status, JobRunStatus::Succeeded);
    assert_eq!(second.status, JobRunStatus::Succeeded);
    assert_ne!(first.id, second.id);

    // Staging keeps both runs; curated facts converge.
    assert_eq!(h.db.count_by_run(org.id, first.id).await.unwrap(), 120);
    assert_eq!(h.db.count_by_run(org.id, second.id).await.unwrap(), 120);
    assert_eq!(h.db.count_facts(org.id).await.unwrap(), 120);

    let runs = h
        .engine
        .list_job_runs(org.id, Default::default())
        .await
        .unwrap();
    assert_eq!(runs.len(), 2);
}

#[tokio::test]
async fn tenants_never_see_each_other() {
    let h = harness().await;
    let acme = h.engine.create_organization("acme", "Acme").await.unwrap();
    let globex = h.engine.create_organization("globex", "Globex").await.unwrap();
    let source = sql_source(&h, &acme, 30).await;
    let run = h.engine.trigger_ingestion(acme.id, source.id).await.unwrap();
    assert_eq!(run.status, JobRunStatus::Succeeded);

    let err = h
        .engine
        .trigger_ingestion(globex.id, source.id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert!(matches!(
        h.engine.get_job_run(globex.id, run.id).await,
        Err(Error::NotFound(_))
    ));
    assert_eq!(h.db.count_by_run(globex.id, run.id).await.unwrap(), 0);
    assert_eq!(h.db.count_facts(globex.id).await.unwrap(), 0);

    let rows = h
        .indicators
        .run("value_by_region", globex.id, &IndicatorParams::default())
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn spreadsheet_source_without_credential_fails_closed() {
    let h = harness().await;
    let org = h.engine.create_organization("acme", "Acme").await.unwrap();
    let source = h
        .engine
        .register_source(
            DataSource::new(
                org.id,
                "carteira",
                SourceConfig::GoogleSheets {
                    spreadsheet_id: "sheet-1".to_string(),
                    range: "Dados!A1:Z".to_string(),
                    creditor_code: None,
                },
                true,
                Some(60),
                None,
            )
            .unwrap(),
        )
        .await
        .unwrap();

    let run = h.engine.trigger_ingestion(org.id, source.id).await.unwrap();
    assert_eq!(run.status, JobRunStatus::Failed);
    assert_eq!(run.rows_staged, 0);
    assert!(run.error_detail.as_deref().unwrap().starts_with("AuthError"));
}

#[tokio::test]
async fn csv_upload_rejects_bad_rows_and_keeps_the_rest() {
    let h = harness().await;
    let org = h.engine.create_organization("acme", "Acme").await.unwrap();
    let source = h
        .engine
        .register_source(
            DataSource::new(
                org.id,
                "planilha",
                SourceConfig::CsvUpload {
                    path: None,
                    format: FileFormat::Csv,
                    delimiter: None,
                    creditor_code: None,
                },
                false,
                None,
                None,
            )
            .unwrap(),
        )
        .await
        .unwrap();

    let csv = "Processo;Data Cadastro;Vl Título;UF;Vencimento;Repasse\n\
               A1;15/01/2024;1.234,56;sp;2023-12-01;100,00\n\
               A2;16/01/2024;n/d;rj;2024-01-10;\n\
               A3;02/02/2024;10;sp;;\n";
    let run = h
        .engine
        .ingest_upload(org.id, source.id, csv.as_bytes().to_vec(), None)
        .await
        .unwrap();
    assert_eq!(run.status, JobRunStatus::Succeeded, "{:?}", run.error_detail);
    assert_eq!(run.rows_staged, 3);
    assert_eq!(run.rows_transformed, 2);
    assert_eq!(run.rows_rejected, 1);
    assert_eq!(run.rejected_sample[0].row_index, 1);
    assert_eq!(run.rejected_sample[0].code, "TypeCoercionError");

    let as_of = IndicatorParams::parse(None, Some("2024-02-10"), Vec::<(String, String)>::new()).unwrap();
    let bands = h
        .indicators
        .run("value_by_maturity_band", org.id, &as_of)
        .await
        .unwrap();
    let labels: Vec<_> = bands.iter().map(|r| r.bucket.as_str()).collect();
    assert_eq!(labels, vec!["61-90", "unspecified"]);
    assert!((bands[0].total - 1234.56).abs() < 1e-9);

    let recovered = h
        .indicators
        .run("recovered_by_maturity_band", org.id, &as_of)
        .await
        .unwrap();
    assert_eq!(recovered[0].bucket, "61-90");
    assert!((recovered[0].total - 100.0).abs() < 1e-9);
    assert_eq!(recovered[1].bucket, "unspecified");
    assert_eq!(recovered[1].total, 0.0);
}

#[tokio::test]
async fn indicators_on_empty_tenant_return_no_rows() {
    let h = harness().await;
    let org = h.engine.create_organization("acme", "Acme").await.unwrap();
    for def in h.indicators.list() {
        let rows = h
            .indicators
            .run(def.name, org.id, &IndicatorParams::default())
            .await
            .unwrap();
        assert!(rows.is_empty(), "{} returned rows", def.name);
    }
}
