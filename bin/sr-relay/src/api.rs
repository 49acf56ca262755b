//! Operator HTTP surface.
//!
//! Besides probes and `/metrics`, operators inspect the backlog and requeue
//! DLQ entries here. `POST /entries` lets producers that cannot link the
//! crate enqueue over JSON.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sr_common::{EntryStatus, OutboxEntry};
use sr_delivery::{DispatchStatsSnapshot, Dispatcher};
use sr_heartbeat::HeartbeatMonitor;
use sr_outbox::{Outbox, OutboxError};
use std::sync::Arc;
use tracing::error;

const DEFAULT_LIST_LIMIT: u32 = 100;
const MAX_LIST_LIMIT: u32 = 1000;

#[derive(Clone)]
pub struct AppState {
    pub outbox: Outbox,
    pub dispatcher: Arc<Dispatcher>,
    pub monitor: Arc<HeartbeatMonitor>,
    pub metrics: PrometheusHandle,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/backlog", get(backlog_handler))
        .route("/dlq", get(dlq_handler))
        .route("/dlq/{id}/requeue", post(requeue_handler))
        .route("/entries", post(enqueue_handler))
        .with_state(state)
}

/// Error response body
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

pub struct ApiError(OutboxError);

impl From<OutboxError> for ApiError {
    fn from(err: OutboxError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self.0 {
            OutboxError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            OutboxError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            OutboxError::InvalidState { .. } => (StatusCode::BAD_REQUEST, "INVALID_STATE"),
            OutboxError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            OutboxError::ClaimLost(_) => (StatusCode::CONFLICT, "CLAIM_LOST"),
            _ => {
                error!(error = %self.0, "Operator request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.0.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.render()
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    heartbeat: &'static str,
    heartbeat_age_secs: Option<f64>,
    dispatcher_running: bool,
    dispatcher: DispatchStatsSnapshot,
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let heartbeat = state.monitor.status();
    let stalled = state.monitor.is_stalled();

    let body = HealthResponse {
        status: if stalled { "stalled" } else { "ok" },
        heartbeat: heartbeat.as_str(),
        heartbeat_age_secs: heartbeat.age().map(|age| age.as_secs_f64()),
        dispatcher_running: state.dispatcher.is_running(),
        dispatcher: state.dispatcher.stats(),
    };

    let code = if stalled {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(body))
}

async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    if !state.dispatcher.is_running() {
        return (StatusCode::SERVICE_UNAVAILABLE, "DISPATCHER NOT RUNNING");
    }
    match state.outbox.counts().await {
        Ok(_) => (StatusCode::OK, "READY"),
        Err(e) => {
            error!(error = %e, "Readiness probe could not reach the outbox store");
            (StatusCode::SERVICE_UNAVAILABLE, "STORE UNAVAILABLE")
        }
    }
}

#[derive(Debug, Deserialize)]
struct BacklogQuery {
    status: Option<String>,
    limit: Option<u32>,
}

fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

async fn backlog_handler(
    State(state): State<AppState>,
    Query(query): Query<BacklogQuery>,
) -> ApiResult<Json<Vec<OutboxEntry>>> {
    let status = match query.status.as_deref() {
        None => EntryStatus::Pending,
        Some(raw) => raw
            .parse::<EntryStatus>()
            .map_err(|_| OutboxError::Validation(format!("unknown status: {}", raw)))?,
    };
    let entries = state.outbox.backlog(status, clamp_limit(query.limit)).await?;
    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<u32>,
}

async fn dlq_handler(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<OutboxEntry>>> {
    let entries = state.outbox.list_dlq(clamp_limit(query.limit)).await?;
    Ok(Json(entries))
}

async fn requeue_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<OutboxEntry>> {
    let entry = state.outbox.requeue_from_dlq(&id).await?;
    Ok(Json(entry))
}

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    channel_id: String,
    event_key: String,
    payload: Value,
}

async fn enqueue_handler(
    State(state): State<AppState>,
    Json(req): Json<EnqueueRequest>,
) -> ApiResult<Response> {
    let result = state
        .outbox
        .enqueue(req.channel_id, req.event_key, req.payload)
        .await?;
    let code = if result.inserted {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((code, Json(result)).into_response())
}
