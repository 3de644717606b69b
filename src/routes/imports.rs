use std::convert::Infallible;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::import_run::{ImportRun, ImportStats, RunPage};
use crate::models::source::FeedSource;
use crate::pipeline::{DEFAULT_PAGE_LIMIT, QueueStatus};
use crate::routes::AppState;
use crate::scheduler::TaskStatus;

#[derive(Debug, Deserialize)]
pub struct StartImport {
    pub source: FeedSource,
    pub feed_url: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ManualImport {
    pub source: Option<FeedSource>,
    pub feed_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

pub async fn start(
    State(state): State<AppState>,
    Json(input): Json<StartImport>,
) -> Result<(StatusCode, Json<ImportRun>), AppError> {
    let run = state.service.start_run(input.source, &input.feed_url).await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<RunPage>, AppError> {
    let page = state
        .service
        .history(
            params.page.unwrap_or(1),
            params.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        )
        .await?;
    Ok(Json(page))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ImportRun>, AppError> {
    Ok(Json(state.service.get_run(id).await?))
}

pub async fn stats(State(state): State<AppState>) -> Result<Json<ImportStats>, AppError> {
    Ok(Json(state.service.stats().await?))
}

pub async fn queue_status(State(state): State<AppState>) -> Result<Json<QueueStatus>, AppError> {
    Ok(Json(state.service.queue_status().await?))
}

/// With `source` and `feed_url`, start that one feed. With neither, start
/// every configured target in the background.
pub async fn manual(
    State(state): State<AppState>,
    Json(input): Json<ManualImport>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    match (input.source, input.feed_url) {
        (Some(source), Some(feed_url)) => {
            let run = state.runner.run_single(source, &feed_url).await?;
            Ok((
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "status": "started", "run": run })),
            ))
        }
        (None, None) => {
            let runner = state.runner.clone();
            let targets = runner.targets().len();
            tokio::spawn(async move {
                runner.run_all().await;
            });
            Ok((
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "status": "started", "targets": targets })),
            ))
        }
        _ => Err(AppError::BadRequest(
            "source and feed_url must be given together".to_string(),
        )),
    }
}

pub async fn schedule(State(state): State<AppState>) -> Json<Vec<TaskStatus>> {
    Json(state.scheduler.status())
}

/// Server-sent `import-completed` events, one per terminal run.
pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.notifier.subscribe()).filter_map(|result| async move {
        match result {
            Ok(run) => Event::default()
                .event("import-completed")
                .id(run.id.to_string())
                .json_data(&run)
                .ok()
                .map(Ok),
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                tracing::warn!("Event subscriber lagged, {n} events dropped");
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::models::import_run::CounterDelta;
    use crate::notify::RunNotifier;
    use crate::pipeline::{ImportService, PipelineConfig};
    use crate::queue::{MemoryTaskQueue, RetryPolicy, TaskQueue};
    use crate::routes::router;
    use crate::scheduler::targets::default_targets;
    use crate::scheduler::{HOURLY_IMPORT, Scheduler, SystemClock, TargetRunner};
    use crate::store::{MemoryStore, Store};

    struct Harness {
        app: axum::Router,
        store: Arc<MemoryStore>,
        fetch: Arc<MemoryTaskQueue>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let fetch = Arc::new(MemoryTaskQueue::new(
            "fetch",
            RetryPolicy::new(3, Duration::ZERO),
        ));
        let record = Arc::new(MemoryTaskQueue::new(
            "record",
            RetryPolicy::new(3, Duration::ZERO),
        ));
        let service = ImportService::new(
            store.clone(),
            fetch.clone(),
            record,
            PipelineConfig::default(),
        );
        let runner = Arc::new(TargetRunner::new(
            service.clone(),
            default_targets(),
            Duration::ZERO,
        ));
        let scheduler = Arc::new(Scheduler::new(Arc::new(SystemClock)));
        scheduler
            .register(HOURLY_IMPORT, "0 * * * *", runner.clone())
            .unwrap();

        let app = router(AppState {
            service,
            runner,
            scheduler,
            notifier: RunNotifier::default(),
        });
        Harness { app, store, fetch }
    }

    async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, body)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn start_then_fetch_run() {
        let h = harness();
        let (status, body) = send(
            &h.app,
            post_json(
                "/api/v1/imports",
                serde_json::json!({ "source": "jobicy", "feed_url": "https://jobicy.com/?feed=job_feed" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "running");
        let id = body["id"].as_str().unwrap().to_string();

        let (status, body) = send(&h.app, get_req(&format!("/api/v1/imports/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "jobicy");
        assert_eq!(body["total_fetched"], 0);
    }

    #[tokio::test]
    async fn invalid_feed_url_is_bad_request() {
        let h = harness();
        let (status, body) = send(
            &h.app,
            post_json(
                "/api/v1/imports",
                serde_json::json!({ "source": "jobicy", "feed_url": "ftp://nope" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("ftp://nope"));
    }

    #[tokio::test]
    async fn unknown_source_is_rejected() {
        let h = harness();
        let (status, _) = send(
            &h.app,
            post_json(
                "/api/v1/imports",
                serde_json::json!({ "source": "indeed", "feed_url": "https://indeed.com/rss" }),
            ),
        )
        .await;
        assert!(status.is_client_error());
        assert_eq!(h.store.run_stats().await.unwrap().total_imports, 0);
    }

    #[tokio::test]
    async fn missing_run_is_not_found() {
        let h = harness();
        let (status, _) = send(
            &h.app,
            get_req(&format!("/api/v1/imports/{}", Uuid::new_v4())),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn history_and_stats() {
        let h = harness();
        let run = h
            .store
            .create_run(FeedSource::Jobicy, "https://jobicy.com/?feed=job_feed")
            .await
            .unwrap();
        h.store.set_total_fetched(run.id, 1).await.unwrap();
        h.store
            .increment_counters(run.id, CounterDelta::inserted())
            .await
            .unwrap();
        h.store.complete_run(run.id).await.unwrap();
        h.store
            .create_run(FeedSource::HigherEdJobs, "https://www.higheredjobs.com/rss/articleFeed.cfm")
            .await
            .unwrap();

        let (status, body) = send(&h.app, get_req("/api/v1/imports?page=1&limit=1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["imports"].as_array().unwrap().len(), 1);
        assert_eq!(body["total_count"], 2);
        assert_eq!(body["has_more"], true);

        let (status, body) = send(&h.app, get_req("/api/v1/imports/stats")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_imports"], 2);
        assert_eq!(body["completed_imports"], 1);
        assert_eq!(body["running_imports"], 1);
        assert_eq!(body["total_new_jobs"], 1);
    }

    #[tokio::test]
    async fn manual_single_feed_and_partial_input() {
        let h = harness();
        let (status, body) = send(
            &h.app,
            post_json(
                "/api/v1/imports/manual",
                serde_json::json!({
                    "source": "higheredjobs",
                    "feed_url": "https://www.higheredjobs.com/rss/articleFeed.cfm"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["run"]["source"], "higheredjobs");

        let (status, _) = send(
            &h.app,
            post_json("/api/v1/imports/manual", serde_json::json!({ "source": "jobicy" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn manual_all_targets_runs_in_background() {
        let h = harness();
        let (status, body) = send(
            &h.app,
            post_json("/api/v1/imports/manual", serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["targets"], 9);

        for _ in 0..100 {
            if h.fetch.counts().await.unwrap().depth() == 9 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.fetch.counts().await.unwrap().depth(), 9);
    }

    #[tokio::test]
    async fn queue_and_schedule_status() {
        let h = harness();
        let (status, body) = send(&h.app, get_req("/api/v1/imports/queue")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["fetch"]["waiting"], 0);
        assert_eq!(body["record"]["failed"], 0);

        let (status, body) = send(&h.app, get_req("/api/v1/imports/schedule")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["name"], HOURLY_IMPORT);
        assert_eq!(body[0]["running"], false);
    }
}
