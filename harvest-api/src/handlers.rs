use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error};
use uuid::Uuid;

use harvest_queue::{
    DeadLetterManager, JobKind, JobState, LabelPayload, Queue, QueueError, QueueMonitor,
    ScrapePayload,
};

#[derive(Clone)]
pub struct ApiState {
    pub queue: Queue,
    pub dead_letters: DeadLetterManager,
    pub monitor: Arc<QueueMonitor>,
}

impl ApiState {
    pub fn new(queue: Queue, dead_letters: DeadLetterManager) -> Self {
        let monitor = Arc::new(QueueMonitor::new(queue.clone(), dead_letters.clone()));
        Self {
            queue,
            dead_letters,
            monitor,
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

fn map_queue_error(error: QueueError) -> ApiError {
    match &error {
        QueueError::Codec(codec_error) => bad_request(codec_error.to_string()),
        QueueError::UnknownDeadLetter(_) | QueueError::UnknownJob(_) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: error.to_string(),
            }),
        ),
        _ => {
            error!(%error, "internal error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: error.to_string(),
                }),
            )
        }
    }
}

fn parse_kind(kind: &str) -> Result<JobKind, ApiError> {
    JobKind::from_str(kind).map_err(bad_request)
}

#[derive(Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub job_id: Uuid,
}

/// Jobs are validated at the enqueue boundary: an invalid payload is
/// rejected here with 400 and never reaches the queue or the DLQ.
async fn enqueue_scrape(
    State(state): State<ApiState>,
    Json(payload): Json<ScrapePayload>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    debug!(app_id = %payload.app_id, "received scrape job request");
    let job = payload.into_job().map_err(|e| bad_request(e.to_string()))?;
    let job_id = state.queue.enqueue(job).await.map_err(map_queue_error)?;
    Ok(Json(EnqueueResponse { job_id }))
}

async fn enqueue_label(
    State(state): State<ApiState>,
    Json(payload): Json<LabelPayload>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    debug!(reviews = payload.review_ids.len(), "received label job request");
    let job = payload.into_job().map_err(|e| bad_request(e.to_string()))?;
    let job_id = state.queue.enqueue(job).await.map_err(map_queue_error)?;
    Ok(Json(EnqueueResponse { job_id }))
}

async fn queue_snapshot(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.monitor.snapshot().await.map_err(map_queue_error)?;
    Ok(Json(snapshot))
}

async fn queue_stats(
    State(state): State<ApiState>,
    Path(kind): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = parse_kind(&kind)?;
    let stats = state.queue.stats(kind).await.map_err(map_queue_error)?;
    Ok(Json(stats))
}

async fn pause_queue(
    State(state): State<ApiState>,
    Path(kind): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = parse_kind(&kind)?;
    state.queue.pause(kind).await.map_err(map_queue_error)?;
    Ok(Json(json!({ "paused": true })))
}

async fn resume_queue(
    State(state): State<ApiState>,
    Path(kind): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = parse_kind(&kind)?;
    state.queue.resume(kind).await.map_err(map_queue_error)?;
    Ok(Json(json!({ "paused": false })))
}

#[derive(Deserialize)]
struct CleanQuery {
    older_than_hours: u64,
    /// `completed` (default) or `failed`.
    state: Option<String>,
}

async fn clean_queue(
    State(state): State<ApiState>,
    Path(kind): Path<String>,
    Query(query): Query<CleanQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = parse_kind(&kind)?;
    let job_state = match query.state.as_deref() {
        None | Some("completed") => JobState::Completed,
        Some("failed") => JobState::Failed,
        Some(other) => return Err(bad_request(format!("{} is not cleanable", other))),
    };
    let removed = state
        .queue
        .clean(
            kind,
            job_state,
            Duration::from_secs(query.older_than_hours * 3600),
        )
        .await
        .map_err(map_queue_error)?;
    Ok(Json(json!({ "removed": removed })))
}

#[derive(Deserialize)]
struct DlqListQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Serialize)]
struct DeadLetterView {
    id: Uuid,
    job_id: Uuid,
    kind: JobKind,
    payload: serde_json::Value,
    correlation_id: Uuid,
    failure_reason: String,
    failure_stack: Option<String>,
    attempts_made: i32,
    failed_at: chrono::DateTime<chrono::Utc>,
}

async fn list_dead_letters(
    State(state): State<ApiState>,
    Path(kind): Path<String>,
    Query(query): Query<DlqListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = parse_kind(&kind)?;
    let records = state
        .dead_letters
        .get_dead_letters(
            kind,
            query.limit.unwrap_or(50).clamp(1, 500),
            query.offset.unwrap_or(0).max(0),
        )
        .await
        .map_err(map_queue_error)?;

    let views: Vec<DeadLetterView> = records
        .into_iter()
        .map(|record| DeadLetterView {
            id: record.id,
            job_id: record.job_id,
            kind: record.kind,
            payload: record.payload.0,
            correlation_id: record.correlation_id,
            failure_reason: record.failure_reason,
            failure_stack: record.failure_stack,
            attempts_made: record.attempts_made,
            failed_at: record.failed_at,
        })
        .collect();
    Ok(Json(views))
}

async fn dead_letter_stats(
    State(state): State<ApiState>,
    Path(kind): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = parse_kind(&kind)?;
    let stats = state
        .dead_letters
        .stats(kind)
        .await
        .map_err(map_queue_error)?;
    Ok(Json(stats))
}

async fn replay_dead_letter(
    State(state): State<ApiState>,
    Path((kind, dlq_id)): Path<(String, Uuid)>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    let kind = parse_kind(&kind)?;
    let job_id = state
        .dead_letters
        .replay(kind, dlq_id)
        .await
        .map_err(map_queue_error)?;
    Ok(Json(EnqueueResponse { job_id }))
}

#[derive(Serialize, Deserialize)]
pub struct ReplayByReasonBody {
    pub reason: String,
    #[serde(default = "default_max_replays")]
    pub max_jobs: i64,
}

fn default_max_replays() -> i64 {
    100
}

async fn replay_by_reason(
    State(state): State<ApiState>,
    Path(kind): Path<String>,
    Json(body): Json<ReplayByReasonBody>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = parse_kind(&kind)?;
    if body.reason.trim().is_empty() {
        return Err(bad_request("reason must not be empty"));
    }
    let job_ids = state
        .dead_letters
        .replay_by_reason(kind, &body.reason, body.max_jobs.clamp(1, 1000))
        .await
        .map_err(map_queue_error)?;
    Ok(Json(json!({ "job_ids": job_ids })))
}

async fn liveness() -> StatusCode {
    StatusCode::OK
}

pub fn add_routes(router: Router<ApiState>, state: ApiState) -> Router {
    router
        .route("/_liveness", get(liveness))
        .route("/jobs/scrape", post(enqueue_scrape))
        .route("/jobs/label", post(enqueue_label))
        .route("/queues", get(queue_snapshot))
        .route("/queues/:kind/stats", get(queue_stats))
        .route("/queues/:kind/pause", post(pause_queue))
        .route("/queues/:kind/resume", post(resume_queue))
        .route("/queues/:kind/clean", post(clean_queue))
        .route("/dlq/:kind", get(list_dead_letters))
        .route("/dlq/:kind/stats", get(dead_letter_stats))
        .route("/dlq/:kind/replay/:dlq_id", post(replay_dead_letter))
        .route("/dlq/:kind/replay_by_reason", post(replay_by_reason))
        .with_state(state)
}
