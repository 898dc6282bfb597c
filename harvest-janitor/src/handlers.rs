use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::info;

use harvest_queue::{QueueJanitor, QueueMonitor};

pub struct AppContext {
    pub janitor: QueueJanitor,
    pub monitor: QueueMonitor,
}

async fn index() -> &'static str {
    "harvest-janitor"
}

/// The janitor is alive as long as it can answer; the interesting state
/// lives in the queue tables it maintains.
async fn liveness() -> StatusCode {
    StatusCode::OK
}

async fn force_cleanup(State(context): State<Arc<AppContext>>) -> impl IntoResponse {
    info!("forcing a janitor pass");
    match context.janitor.run_once().await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response(),
    }
}

async fn monitor_snapshot(State(context): State<Arc<AppContext>>) -> impl IntoResponse {
    match context.monitor.snapshot().await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response(),
    }
}

pub fn app(context: Arc<AppContext>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_liveness", get(liveness))
        .route("/cleanup", post(force_cleanup))
        .route("/monitor", get(monitor_snapshot))
        .with_state(context)
        .merge(harvest_common::metrics::setup_metrics_router())
}
