//! HTTP surface: agent callbacks, the GitHub webhook fast path and a small
//! operator API.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use grid_common::Checkpoint;
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::coordinator::budget::BudgetManager;
use crate::coordinator::checkpoint::CheckpointStore;
use crate::coordinator::db::ExecutionQuery;
use crate::coordinator::{CompletionReport, CoordinatorHandle, CyclePhase, DbHandle};
use crate::errors::GridError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub coordinator: CoordinatorHandle,
    pub db: DbHandle,
    pub budget: BudgetManager,
    pub repo: String,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct NudgeRequest {
    pub issue_number: u64,
    pub source_execution_id: Option<String>,
    #[serde(default)]
    pub priority: i64,
    pub reason: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<GridError> for ApiError {
    fn from(err: GridError) -> Self {
        match err {
            GridError::ExecutionNotFound { .. } => ApiError::NotFound(err.to_string()),
            GridError::BadRequest(_) | GridError::Parse { .. } => {
                ApiError::BadRequest(err.to_string())
            }
            GridError::CoordinatorStopped => ApiError::Unavailable(err.to_string()),
            other => {
                tracing::error!(error = %format!("{:#}", other), "request failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::from(GridError::Store(err))
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/agent-status", post(agent_status))
        .route("/webhooks/github", post(github_webhook))
        .route("/api/cycle", post(run_cycle))
        .route("/api/executions", get(list_executions))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
        .route("/api/executions/{id}/checkpoint", put(save_checkpoint))
        .route("/api/budget", get(budget_status))
        .route("/api/nudge", post(create_nudge))
        .route("/api/nudges", get(list_nudges))
}

pub fn build_router(state: SharedState) -> Router {
    api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    addr: &str,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;
    Ok(())
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn agent_status(
    State(state): State<SharedState>,
    Json(report): Json<CompletionReport>,
) -> Result<Json<Value>, ApiError> {
    tracing::info!(execution_id = %report.execution_id, status = report.status.as_str(), "agent status received");
    let outcome = state.coordinator.complete(report).await?;
    Ok(Json(json!({"status": outcome.as_str()})))
}

async fn github_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let event = header("x-github-event")
        .ok_or_else(|| ApiError::BadRequest("missing X-GitHub-Event header".into()))?;

    let delivery = header("x-github-delivery");
    if let Some(id) = delivery.clone() {
        if state.db.call(move |db| db.delivery_seen(&id)).await? {
            return Ok((StatusCode::OK, Json(json!({"status": "duplicate"}))));
        }
    }

    if event == "ping" {
        record_delivery(&state, delivery, &event).await?;
        return Ok((StatusCode::OK, Json(json!({"status": "pong"}))));
    }

    let action = payload.get("action").and_then(Value::as_str);
    let Some(phase) = CyclePhase::for_github_event(&event, action) else {
        record_delivery(&state, delivery, &event).await?;
        return Ok((StatusCode::OK, Json(json!({"status": "ignored"}))));
    };

    // Only a queued delivery counts as handled, so a redelivery after a full
    // queue is tried again.
    if state.coordinator.enqueue_phase(phase)? {
        record_delivery(&state, delivery, &event).await?;
        tracing::info!(event = %event, phase = %phase, "webhook queued phase");
        Ok((StatusCode::ACCEPTED, Json(json!({"status": "queued", "phase": phase}))))
    } else {
        tracing::warn!(event = %event, "coordinator queue full, webhook ignored");
        Ok((StatusCode::OK, Json(json!({"status": "ignored"}))))
    }
}

async fn record_delivery(
    state: &AppState,
    delivery: Option<String>,
    event: &str,
) -> Result<(), ApiError> {
    if let Some(id) = delivery {
        let event = event.to_string();
        state
            .db
            .call(move |db| db.record_delivery(&id, &event))
            .await?;
    }
    Ok(())
}

async fn run_cycle(State(state): State<SharedState>) -> Result<Json<Value>, ApiError> {
    let report = state.coordinator.run_cycle().await?;
    Ok(Json(serde_json::to_value(report).map_err(anyhow::Error::from)?))
}

async fn list_executions(
    State(state): State<SharedState>,
    Query(query): Query<ExecutionQuery>,
) -> Result<Json<Value>, ApiError> {
    let executions = state.db.call(move |db| db.list_executions(&query)).await?;
    Ok(Json(json!({ "executions": executions })))
}

async fn get_execution(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let lookup = id.clone();
    let execution = state
        .db
        .call(move |db| db.get_execution(&lookup))
        .await?
        .ok_or(GridError::ExecutionNotFound { id })?;
    Ok(Json(serde_json::to_value(execution).map_err(anyhow::Error::from)?))
}

async fn cancel_execution(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state.coordinator.cancel(&id).await?;
    Ok(Json(json!({"status": outcome.as_str()})))
}

/// Progress an agent wants kept even if it never reports completion.
async fn save_checkpoint(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(checkpoint): Json<Checkpoint>,
) -> Result<Json<Value>, ApiError> {
    let saved = CheckpointStore::new(state.db.clone())
        .save(&id, checkpoint)
        .await?;
    if !saved {
        return Err(GridError::ExecutionNotFound { id }.into());
    }
    Ok(Json(json!({"status": "saved"})))
}

async fn budget_status(State(state): State<SharedState>) -> Result<Json<Value>, ApiError> {
    let status = state.budget.status().await?;
    Ok(Json(serde_json::to_value(status).map_err(anyhow::Error::from)?))
}

async fn create_nudge(
    State(state): State<SharedState>,
    Json(req): Json<NudgeRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let repo = state.repo.clone();
    let nudge = state
        .db
        .call(move |db| {
            db.create_nudge(
                &repo,
                req.issue_number,
                req.source_execution_id.as_deref(),
                req.priority,
                req.reason.as_deref(),
            )
        })
        .await?;
    tracing::info!(issue = nudge.issue_number, priority = nudge.priority, "nudge queued");
    Ok((
        StatusCode::CREATED,
        Json(serde_json::to_value(nudge).map_err(anyhow::Error::from)?),
    ))
}

async fn list_nudges(State(state): State<SharedState>) -> Result<Json<Value>, ApiError> {
    let repo = state.repo.clone();
    let nudges = state
        .db
        .call(move |db| db.pending_nudges(&repo, 100))
        .await?;
    Ok(Json(json!({ "nudges": nudges })))
}
