use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use clap::Parser;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use jobimporter::config::{Command, Config, LogFormat, PipelineArgs};
use jobimporter::db;
use jobimporter::error::QueueError;
use jobimporter::feeds::HttpFeedFetcher;
use jobimporter::notify::RunNotifier;
use jobimporter::pipeline::ImportPipeline;
use jobimporter::queue::{FETCH_QUEUE, PgTaskQueue, RECORD_QUEUE, TaskQueue};
use jobimporter::routes::{self, AppState};
use jobimporter::scheduler::{
    DAILY_CLEANUP, HOURLY_IMPORT, RetentionCleanup, Scheduler, SystemClock, TargetRunner,
};
use jobimporter::store::{PgStore, Store};

const SCHEDULER_POLL: Duration = Duration::from_secs(30);

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(pool: PgPool) -> impl IntoResponse {
    let result: Result<(i32,), _> = sqlx::query_as("SELECT 1").fetch_one(&pool).await;
    match result {
        Ok(_) => (StatusCode::OK, "ready"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "not ready"),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("jobimporter=info,tower_http=info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Cancelled on SIGINT.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received, exiting gracefully"),
            Err(e) => {
                tracing::error!("Failed to listen for shutdown signal: {e}");
                return;
            }
        }
        trigger.cancel();
    });
    token
}

fn spawn_workers(
    pipeline: &ImportPipeline,
    args: &PipelineArgs,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<Result<(), QueueError>>> {
    vec![
        tokio::spawn(pipeline.fetch_worker(args.fetch_worker()).run(cancel.clone())),
        tokio::spawn(pipeline.record_worker(args.record_worker()).run(cancel.clone())),
    ]
}

async fn join_workers(handles: Vec<JoinHandle<Result<(), QueueError>>>) {
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Worker exited with error: {e}"),
            Err(e) => tracing::error!("Worker task aborted: {e}"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::parse();
    init_tracing(config.log_format);

    tracing::info!("Connecting to database...");
    let pool = db::create_pool(&config.database_url).await?;

    if config.run_migrations {
        tracing::info!("Running database migrations...");
        db::run_migrations(&pool).await?;
        tracing::info!("Migrations complete");
    }

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));
    let fetch_queue: Arc<dyn TaskQueue> = Arc::new(PgTaskQueue::new(
        pool.clone(),
        FETCH_QUEUE,
        config.pipeline.fetch_policy(),
    ));
    let record_queue: Arc<dyn TaskQueue> = Arc::new(PgTaskQueue::new(
        pool.clone(),
        RECORD_QUEUE,
        config.pipeline.record_policy(),
    ));
    let notifier = RunNotifier::default();
    let fetcher = Arc::new(HttpFeedFetcher::new(config.pipeline.fetch_timeout())?);

    let pipeline = ImportPipeline::new(
        store.clone(),
        fetch_queue.clone(),
        record_queue.clone(),
        fetcher,
        notifier.clone(),
        config.pipeline.pipeline_config(),
    );
    let runner = Arc::new(TargetRunner::new(
        pipeline.service().clone(),
        config.schedule.targets()?,
        config.schedule.inter_target_delay(),
    ));

    match config.resolved_command() {
        Command::Serve { listen_addr } => {
            let cancel = shutdown_token();

            let scheduler = Arc::new(Scheduler::new(Arc::new(SystemClock)));
            scheduler.register(HOURLY_IMPORT, &config.schedule.import_cron, runner.clone())?;
            scheduler.register(
                DAILY_CLEANUP,
                &config.schedule.cleanup_cron,
                Arc::new(RetentionCleanup::new(
                    store.clone(),
                    vec![fetch_queue, record_queue],
                    config.schedule.retention_days,
                    Arc::new(SystemClock),
                )),
            )?;
            scheduler.start_all();

            let scheduler_handle = {
                let scheduler = scheduler.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { scheduler.run(SCHEDULER_POLL, cancel).await })
            };
            let workers = spawn_workers(&pipeline, &config.pipeline, &cancel);

            let readyz_pool = pool.clone();
            let app = Router::new()
                .route("/healthz", get(healthz))
                .route("/readyz", get(move || readyz(readyz_pool.clone())))
                .merge(routes::router(AppState {
                    service: pipeline.service().clone(),
                    runner,
                    scheduler,
                    notifier,
                }))
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive());

            let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
            tracing::info!("Listening on {listen_addr}");
            axum::serve(listener, app)
                .with_graceful_shutdown(cancel.clone().cancelled_owned())
                .await?;

            cancel.cancel();
            join_workers(workers).await;
            if let Err(e) = scheduler_handle.await {
                tracing::error!("Scheduler task aborted: {e}");
            }
        }
        Command::Worker => {
            let cancel = shutdown_token();
            let workers = spawn_workers(&pipeline, &config.pipeline, &cancel);
            join_workers(workers).await;
        }
        Command::Import { source, feed_url } => match (source, feed_url) {
            (Some(source), Some(feed_url)) => {
                let run = runner.run_single(source, &feed_url).await?;
                tracing::info!(run_id = %run.id, %source, "Import run queued");
            }
            _ => {
                let summary = runner.run_all().await;
                if !summary.failed.is_empty() {
                    anyhow::bail!("Failed to start imports for: {}", summary.failed.join(", "));
                }
            }
        },
    }

    Ok(())
}
