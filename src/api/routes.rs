//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use super::sse;
use super::state::AppState;
use crate::events::Progress;
use crate::metrics;

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 200;
const PROGRESS_BUFFER: usize = 64;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/actions", get(list_actions))
        .route("/results", get(list_results))
        .route("/audit", get(list_audit))
        .route("/runner/execute", post(runner_execute))
        .route("/verify/{service}/stream", post(verify_stream))
        .route("/pipeline/run", post(pipeline_run))
        .route("/gate/{service}", get(gate_preview))
        .route("/incidents", get(list_incidents))
        .route("/incidents/stats", get(incident_stats))
        .route("/services/health", get(services_health))
}

/// Any handler failure becomes a 500 with a JSON error body.
pub struct ApiError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        ApiError(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(error = %self.0, "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

fn meta() -> Value {
    json!({
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

async fn status(State(state): State<AppState>) -> ApiResult {
    let depth = state.queue.depth()?;
    let recent = state.queue.list_recent(10)?;
    Ok(Json(json!({
        "data": {
            "queue_depth": depth,
            "recent_actions": recent,
            "pipeline_running": state.lock.is_held(),
            "verification": state.worker.snapshot(),
        },
        "meta": meta()
    })))
}

async fn list_actions(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> ApiResult {
    let actions = state.queue.list_recent(q.limit())?;
    Ok(Json(json!({ "data": actions, "meta": { "total": actions.len() } })))
}

async fn list_results(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> ApiResult {
    let results = state.queue.results(q.limit())?;
    Ok(Json(json!({ "data": results, "meta": { "total": results.len() } })))
}

async fn list_audit(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> ApiResult {
    let records = state.audit.list_recent(q.limit())?;
    Ok(Json(json!({ "data": records, "meta": { "total": records.len() } })))
}

async fn runner_execute(State(state): State<AppState>) -> ApiResult {
    let outcome = state.runner.run_once().await?;
    Ok(Json(json!({ "data": outcome, "meta": meta() })))
}

async fn verify_stream(State(state): State<AppState>, Path(service): Path<String>) -> Response {
    let (progress, rx) = Progress::channel(PROGRESS_BUFFER);
    let worker = state.worker.clone();
    tokio::spawn(async move {
        // Failures are already reported on the stream as `error` events.
        let _ = worker.verify_on_demand(&service, &progress).await;
    });
    sse::from_channel(rx).into_response()
}

async fn pipeline_run(State(state): State<AppState>) -> Response {
    let (progress, rx) = Progress::channel(PROGRESS_BUFFER);
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        if let Err(e) = pipeline.run(&progress).await {
            error!(error = %e, "pipeline run failed");
            progress
                .emit("error", json!({ "text": format!("Pipeline failed: {:#}", e) }))
                .await;
        }
    });
    sse::from_channel(rx).into_response()
}

async fn gate_preview(State(state): State<AppState>, Path(service): Path<String>) -> ApiResult {
    let decision = state.gate.check(&service, Utc::now())?;
    Ok(Json(json!({
        "data": {
            "service": service,
            "allowed": decision.is_allowed(),
            "decision": decision,
            "message": decision.describe(&service),
        },
        "meta": meta()
    })))
}

async fn list_incidents(State(state): State<AppState>) -> ApiResult {
    let incidents = state.incidents.list_recent(DEFAULT_LIMIT)?;
    Ok(Json(json!({ "data": incidents, "meta": { "total": incidents.len() } })))
}

async fn incident_stats(State(state): State<AppState>) -> ApiResult {
    let stats = state.incidents.stats(Utc::now() - Duration::hours(24))?;
    Ok(Json(json!({ "data": stats, "meta": meta() })))
}

async fn services_health(State(state): State<AppState>) -> ApiResult {
    let health = metrics::service_health(&state.pool, Utc::now() - Duration::minutes(5))?;
    Ok(Json(json!({ "data": health, "meta": { "total": health.len() } })))
}
