//! Ops HTTP API.
//!
//! Thin axum handlers delegate to `*_inner` functions returning
//! `(StatusCode, serde_json::Value)`, which tests call directly.
//!
//! Endpoints:
//! - `GET /health`: database check
//! - `GET /version`: build version
//! - `POST /traces`: enqueue a captured trace (`202 Accepted`)
//! - `POST /jobs/{job}[?context=<schema>]`: run a batch job now, in one
//!   schema or in every analysis schema, and return the reports by schema

use std::sync::Arc;

use anyhow::Result;
use apiscope_core::models::QueuedTrace;
use apiscope_core::Context;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::engine::Engine;
use crate::queue::WorkQueue;
use crate::subsystems::scheduler::{self, JobKind};

#[derive(Debug, Default, Deserialize)]
pub struct JobParams {
    /// Run only in this schema.
    pub context: Option<String>,
}

#[derive(Clone)]
pub struct HttpState {
    pub engine: Arc<Engine>,
    pub queue: Arc<dyn WorkQueue>,
}

pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/traces", post(enqueue_handler))
        .route("/jobs/:job", post(job_handler))
        .with_state(state)
}

/// Serve until the shutdown signal fires.
pub async fn start_http_server(state: Arc<HttpState>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let http = &state.engine.config.http;
    let addr = format!("{}:{}", http.host, http.port);
    let app = build_router(Arc::clone(&state));
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down");
        })
        .await?;
    Ok(())
}

// ============================================================================
// Inner functions
// ============================================================================

pub async fn health_inner(state: &HttpState) -> (StatusCode, serde_json::Value) {
    match apiscope_core::db::health_check(&state.engine.pool).await {
        Ok(version) => {
            let queued = state.queue.len().await.ok();
            (
                StatusCode::OK,
                serde_json::json!({
                    "status": "healthy",
                    "version": env!("CARGO_PKG_VERSION"),
                    "postgresql": version,
                    "queued": queued,
                }),
            )
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({ "status": "unhealthy", "error": e.to_string() }),
        ),
    }
}

pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    })
}

pub async fn enqueue_inner(state: &HttpState, item: QueuedTrace) -> (StatusCode, serde_json::Value) {
    if item.trace.host.trim().is_empty() || item.trace.method.trim().is_empty() {
        return bad_request("trace host and method are required");
    }
    if let Err(e) = state.engine.context(&item.ctx) {
        return bad_request(e.to_string());
    }
    match state.queue.push(&item).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            serde_json::json!({ "status": "queued", "id": item.trace.id }),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Enqueue failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "status": "error", "error": e.to_string() }),
            )
        }
    }
}

pub async fn job_inner(state: &HttpState, job: &str, params: &JobParams) -> (StatusCode, serde_json::Value) {
    let Some(kind) = JobKind::parse(job) else {
        return (
            StatusCode::NOT_FOUND,
            serde_json::json!({ "status": "error", "error": format!("unknown job '{}'", job) }),
        );
    };
    let result = match params.context.as_deref() {
        Some(schema) => {
            let ctx = match Context::new(schema) {
                Ok(ctx) => ctx,
                Err(e) => return bad_request(e.to_string()),
            };
            scheduler::run_job(&state.engine, &ctx, kind).await.map(|report| {
                let mut reports = serde_json::Map::new();
                reports.insert(ctx.schema().to_string(), report);
                reports
            })
        }
        None => scheduler::run_job_everywhere(&state.engine, kind).await,
    };
    match result {
        Ok(reports) => (
            StatusCode::OK,
            serde_json::json!({ "status": "ok", "job": kind.as_str(), "reports": reports }),
        ),
        Err(e) => {
            tracing::error!(job = %kind, error = %e, "Job run failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "status": "error", "job": kind.as_str(), "error": e.to_string() }),
            )
        }
    }
}

fn bad_request(msg: impl Into<String>) -> (StatusCode, serde_json::Value) {
    (
        StatusCode::BAD_REQUEST,
        serde_json::json!({ "status": "error", "error": msg.into() }),
    )
}

// ============================================================================
// Axum handlers
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn enqueue_handler(
    State(state): State<Arc<HttpState>>,
    Json(item): Json<QueuedTrace>,
) -> impl IntoResponse {
    let (status, body) = enqueue_inner(&state, item).await;
    (status, Json(body))
}

pub async fn job_handler(
    State(state): State<Arc<HttpState>>,
    Path(job): Path<String>,
    Query(params): Query<JobParams>,
) -> impl IntoResponse {
    let (status, body) = job_inner(&state, &job, &params).await;
    (status, Json(body))
}
