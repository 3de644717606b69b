pub mod imports;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use crate::notify::RunNotifier;
use crate::pipeline::ImportService;
use crate::scheduler::{Scheduler, TargetRunner};

#[derive(Clone)]
pub struct AppState {
    pub service: ImportService,
    pub runner: Arc<TargetRunner>,
    pub scheduler: Arc<Scheduler>,
    pub notifier: RunNotifier,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/imports", get(imports::list).post(imports::start))
        .route("/imports/stats", get(imports::stats))
        .route("/imports/queue", get(imports::queue_status))
        .route("/imports/manual", post(imports::manual))
        .route("/imports/schedule", get(imports::schedule))
        .route("/imports/events", get(imports::events))
        .route("/imports/{id}", get(imports::get))
        .with_state(state);

    Router::new().nest("/api/v1", api)
}
