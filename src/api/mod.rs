use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::pipeline::{RequestOverrides, SubmitError, TaskPipeline, TaskStatus};
use crate::recipe::TIMEOUT_RANGE;
use crate::storage::{TaskQueue, TaskStore};
use crate::utils::MetricsCollector;

/// Shared state behind every route
pub struct AppState {
    pub pipeline: Arc<TaskPipeline>,
    pub tasks: Arc<TaskStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub metrics: Arc<MetricsCollector>,
    pub backend: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub url: String,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub task_id: String,
    pub status: TaskStatus,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tasks", post(submit_task))
        .route("/tasks/:id", get(get_task))
        .route("/tasks/:id/cancel", post(cancel_task))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and run the submission API
pub async fn serve(addr: &str, state: Arc<AppState>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind API listener on {}", addr))?;

    info!(addr, "Submission API listening");
    axum::serve(listener, router(state))
        .await
        .context("API server failed")?;
    Ok(())
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitRequest>,
) -> Response {
    if let Some(timeout) = request.timeout {
        if !(TIMEOUT_RANGE.0..=TIMEOUT_RANGE.1).contains(&timeout) {
            return error_body(
                StatusCode::BAD_REQUEST,
                &format!(
                    "timeout must be between {} and {} seconds",
                    TIMEOUT_RANGE.0, TIMEOUT_RANGE.1
                ),
            );
        }
    }

    let overrides = RequestOverrides {
        headers: request.headers.unwrap_or_default(),
        timeout: request.timeout,
    };

    match state.pipeline.submit(&request.url, overrides).await {
        Ok(task_id) => (
            StatusCode::ACCEPTED,
            Json(SubmitResponse {
                task_id,
                status: TaskStatus::Queued,
            }),
        )
            .into_response(),
        Err(SubmitError::InvalidUrl(url)) => {
            error_body(StatusCode::BAD_REQUEST, &format!("invalid url: {}", url))
        }
        Err(SubmitError::Storage(e)) => {
            error_body(StatusCode::INTERNAL_SERVER_ERROR, &format!("{:#}", e))
        }
    }
}

async fn get_task(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.tasks.load(&id).await {
        Ok(Some(task)) => (StatusCode::OK, Json(task)).into_response(),
        Ok(None) => error_body(StatusCode::NOT_FOUND, "task not found"),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, &format!("{:#}", e)),
    }
}

async fn cancel_task(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.pipeline.cancel(&id).await {
        Ok(Some(task)) => (StatusCode::OK, Json(task)).into_response(),
        Ok(None) => error_body(StatusCode::NOT_FOUND, "task not found"),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, &format!("{:#}", e)),
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    let queue_depth = state.queue.len().await.unwrap_or(0);
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "backend": state.backend,
            "queueDepth": queue_depth,
        })),
    )
        .into_response()
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.metrics.snapshot().await;
    (StatusCode::OK, Json(snapshot)).into_response()
}
