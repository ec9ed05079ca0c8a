//! HTTP server for the capture agent and the history UI.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/sessions/start` | Start a capture session |
//! | `POST` | `/sessions/stop` | Stop the active session |
//! | `GET`  | `/sessions` | All sessions with capture counts |
//! | `GET`  | `/sessions/{id}` | Captures of one session |
//! | `POST` | `/process` | Submit a capture (acknowledged before it is stored) |
//! | `GET`  | `/status` | Active session and capturing flag |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/api/history?userId=` | Projects of a user, newest first |
//! | `GET`  | `/api/history/{projectId}` | One project |
//! | `GET`  | `/api/files/{project}/{filename}` | Download a stored file |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "no active session" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `unavailable` (503),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted; the capture agent runs
//! as a browser extension.

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

use capture_harness_core::models::ProjectAggregate;
use capture_harness_core::store::ProjectStore;

use crate::blob_store::BlobStore;
use crate::capture::{self, CaptureRequest, CaptureService, SubmitAck};
use crate::config::Config;
use crate::error::SessionError;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub capture: CaptureService,
    /// `None` when the database could not be opened.
    pub projects: Option<Arc<dyn ProjectStore>>,
    pub blobs: Option<Arc<dyn BlobStore>>,
}

pub fn router(config: &Config, state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/sessions/start", post(handle_start))
        .route("/sessions/stop", post(handle_stop))
        .route("/sessions", get(handle_sessions))
        .route("/sessions/{id}", get(handle_session_captures))
        .route("/process", post(handle_process))
        .route("/status", get(handle_status))
        .route("/health", get(handle_health))
        .route("/api/history", get(handle_history))
        .route("/api/history/{project_id}", get(handle_project))
        .route("/api/files/{project}/{filename}", get(handle_file))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.server.max_body_bytes))
        .layer(cors)
        .with_state(state)
}

/// Bind to `[server].bind` and serve until the process ends.
pub async fn run_server(config: &Config, state: AppState) -> anyhow::Result<()> {
    let app = router(config, state);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "capture server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn unavailable(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        code: "unavailable".to_string(),
        message: message.into(),
    }
}

fn internal(err: impl std::fmt::Display) -> AppError {
    tracing::error!(error = %err, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: err.to_string(),
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Unavailable => unavailable(err.to_string()),
            other => bad_request(other.to_string()),
        }
    }
}

// ============ Sessions ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionChange {
    message: &'static str,
    session_id: String,
}

async fn handle_start(State(state): State<AppState>) -> Result<Json<SessionChange>, AppError> {
    let session_id = state.capture.sessions().start().await?;
    Ok(Json(SessionChange {
        message: "Capture session started",
        session_id,
    }))
}

async fn handle_stop(State(state): State<AppState>) -> Result<Json<SessionChange>, AppError> {
    let session_id = state.capture.sessions().stop().await?;
    Ok(Json(SessionChange {
        message: "Capture session stopped",
        session_id,
    }))
}

async fn handle_sessions(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let status = state.capture.sessions().status().await?;
    let sessions = capture::list_sessions(state.capture.capture_dir(), status.active_session.as_deref())
        .await
        .map_err(internal)?;
    Ok(Json(json!({
        "sessions": sessions,
        "currentActiveSession": status.active_session,
        "isCapturing": status.is_capturing,
    })))
}

async fn handle_session_captures(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let captures = capture::list_captures(state.capture.capture_dir(), &id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("session not found: {}", id)))?;
    let status = state.capture.sessions().status().await?;
    let is_active = status.active_session.as_deref() == Some(id.as_str());
    Ok(Json(json!({
        "sessionId": id,
        "captures": captures,
        "isActive": is_active,
        "isCapturing": is_active && status.is_capturing,
    })))
}

// ============ POST /process ============

async fn handle_process(
    State(state): State<AppState>,
    Json(req): Json<CaptureRequest>,
) -> Result<Json<SubmitAck>, AppError> {
    let ack = state.capture.submit(req).await?;
    Ok(Json(ack))
}

// ============ GET /status, GET /health ============

async fn handle_status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let status = state.capture.sessions().status().await?;
    Ok(Json(json!({
        "status": "online",
        "activeSession": status.active_session,
        "isCapturing": status.is_capturing,
        "canStartNewSession": status.active_session.is_none(),
        "time": chrono::Utc::now().to_rfc3339(),
    })))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ History ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryQuery {
    user_id: Option<String>,
}

fn project_store(state: &AppState) -> Result<&Arc<dyn ProjectStore>, AppError> {
    state
        .projects
        .as_ref()
        .ok_or_else(|| unavailable("project storage is not available"))
}

async fn handle_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ProjectAggregate>>, AppError> {
    let user_id = query
        .user_id
        .filter(|u| !u.is_empty())
        .ok_or_else(|| bad_request("userId is required"))?;
    let projects = project_store(&state)?
        .list_projects(&user_id)
        .await
        .map_err(internal)?;
    Ok(Json(projects))
}

async fn handle_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectAggregate>, AppError> {
    project_store(&state)?
        .get_project(&project_id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| not_found(format!("project not found: {}", project_id)))
}

async fn handle_file(
    State(state): State<AppState>,
    Path((project, filename)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let blobs = state
        .blobs
        .as_ref()
        .ok_or_else(|| unavailable("blob storage is not available"))?;
    let blob = blobs
        .find_latest(&project, &filename)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("file not found: {}/{}", project, filename)))?;
    let (blob, data) = blobs
        .get(&blob.id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("file not found: {}/{}", project, filename)))?;

    Ok(([(header::CONTENT_TYPE, blob.metadata.content_type)], data).into_response())
}
