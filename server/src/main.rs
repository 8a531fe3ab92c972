use std::sync::Arc;

use server::api::{self, AppState};
use server::assignment_view::AssignmentView;
use server::batch::repository_sqlx::SqlxBatchRepository;
use server::batching::BatchingEngine;
use server::config::AppConfig;
use server::db::Db;
use server::dispatch::Dispatcher;
use server::logger::init_tracing;
use server::qc_config::repository_sqlx::SqlxQcConfigRepository;
use server::qc_config::resolver::ConfigResolver;
use server::response::repository_sqlx::SqlxResponseRepository;
use server::sampling::SamplingEngine;
use server::scheduler::Scheduler;
use server::verification::VerificationHandler;

/// Connects, migrates, and constructs the three repositories the core
/// depends on. Mirrors the teacher's own `init_store`.
async fn init_repositories(
    cfg: &AppConfig,
) -> anyhow::Result<(
    Arc<SqlxResponseRepository>,
    Arc<SqlxBatchRepository>,
    Arc<SqlxQcConfigRepository>,
)> {
    let db = Db::connect(&cfg.database_url).await?;
    db.migrate().await?;

    let pool = (*db.pool).clone();
    let responses = Arc::new(SqlxResponseRepository::new(pool.clone()));
    let batches = Arc::new(SqlxBatchRepository::new(pool.clone()));
    let qc_configs = Arc::new(SqlxQcConfigRepository::new(pool));

    Ok((responses, batches, qc_configs))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sqlx::any::install_default_drivers();

    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    init_tracing(is_production);

    tracing::info!("starting QC core server");

    let cfg = Arc::new(AppConfig::from_env());

    let (responses, batches, qc_configs) = init_repositories(&cfg).await?;

    let config_resolver = Arc::new(ConfigResolver::new(qc_configs.clone()));
    let sampling = Arc::new(SamplingEngine::new(responses.clone(), batches.clone(), cfg.clone()));
    let batching = Arc::new(BatchingEngine::new(
        responses.clone(),
        batches.clone(),
        config_resolver.clone(),
        sampling.clone(),
        cfg.clone(),
    ));

    let view = AssignmentView::new();
    let dispatcher = Arc::new(Dispatcher::new(responses.clone(), view.clone(), cfg.clone()));
    let verification = Arc::new(VerificationHandler::new(
        responses.clone(),
        batches.clone(),
        view.clone(),
        sampling.clone(),
    ));

    let scheduler = Scheduler::new(
        responses.clone(),
        batches.clone(),
        sampling.clone(),
        view.clone(),
        cfg.clone(),
    );
    scheduler.spawn();

    let state = AppState {
        responses,
        batches,
        qc_configs,
        config_resolver,
        dispatcher,
        verification,
        batching,
        sampling,
        view,
        config: cfg.clone(),
    };

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.http_addr).await?;
    tracing::info!(addr = %cfg.http_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
