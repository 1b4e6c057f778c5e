//! HTTP API server.
//!
//! Exposes ingestion and question answering as a JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/stats` | Index statistics |
//! | `POST` | `/ingest` | Ingest raw text: `{ "text", "title"?, "source"? }` |
//! | `POST` | `/ingest/file` | Ingest an uploaded file (multipart `file`, optional `title`) |
//! | `POST` | `/query` | Answer a question: `{ "query", "top_k"?, "rerank_top_k"? }` |
//! | `DELETE` | `/clear` | Remove everything from the knowledge base |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "empty_index", "message": "the knowledge base is empty; add documents first", "stage": "retrieving" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unsupported_format` (415),
//! `empty_index` (409), `retrieval_error` (502), `generation_error` (502),
//! `clear_in_progress` (503), `timeout` (408), `internal` (500).
//!
//! # Timeouts
//!
//! Query and ingest handlers run under `[server] request_timeout_secs`.
//! When the deadline passes the handler future is dropped, which cancels
//! any in-flight provider call.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::{RagError, Stage};
use crate::models::{IndexStats, IngestReport, QueryResult};
use crate::pipeline::Pipeline;

/// Largest accepted upload.
const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    request_timeout: Duration,
}

/// Starts the HTTP server on `[server] bind`.
///
/// Opens the index and providers from `config`, then serves until the
/// process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let pipeline = Arc::new(Pipeline::from_config(config.clone()).await?);
    let app = build_router(pipeline);

    println!("Answer server listening on http://{}", bind_addr);
    tracing::info!(bind = %bind_addr, "server started");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the router around an existing pipeline.
pub fn build_router(pipeline: Arc<Pipeline>) -> Router {
    let request_timeout = Duration::from_secs(pipeline.config().server.request_timeout_secs);
    let state = AppState {
        pipeline,
        request_timeout,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .route("/ingest", post(handle_ingest))
        .route("/ingest/file", post(handle_ingest_file))
        .route("/query", post(handle_query))
        .route("/clear", delete(handle_clear))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .with_state(state)
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
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<Stage>,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    stage: Option<Stage>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                stage: self.stage,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        let status = match err.code() {
            "bad_request" => StatusCode::BAD_REQUEST,
            "unsupported_format" => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "empty_index" => StatusCode::CONFLICT,
            "retrieval_error" | "generation_error" => StatusCode::BAD_GATEWAY,
            "clear_in_progress" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let stage = match &err {
            RagError::Validation(_) | RagError::UnsupportedFormat(_) | RagError::ClearInProgress => None,
            other => other.stage(),
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
            stage,
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
        stage: None,
    }
}

fn timeout_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::REQUEST_TIMEOUT,
        code: "timeout".to_string(),
        message: message.into(),
        stage: None,
    }
}

fn internal(err: anyhow::Error) -> AppError {
    tracing::error!(error = %err, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: "internal error".to_string(),
        stage: None,
    }
}

/// Run `fut` under the request deadline.
async fn with_deadline<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, RagError>>,
) -> Result<T, AppError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(AppError::from),
        Err(_) => Err(timeout_error(format!(
            "request timed out after {}s",
            limit.as_secs()
        ))),
    }
}

// ============ GET /health ============

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

// ============ GET /stats ============

async fn handle_stats(State(state): State<AppState>) -> Result<Json<IndexStats>, AppError> {
    let stats = state.pipeline.stats().await.map_err(internal)?;
    Ok(Json(stats))
}

// ============ POST /ingest ============

#[derive(Deserialize)]
struct IngestRequest {
    text: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

async fn handle_ingest(
    State(state): State<AppState>,
    body: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<Json<IngestReport>, AppError> {
    let Json(req) = body.map_err(|e| bad_request(e.body_text()))?;
    let report = with_deadline(
        state.request_timeout,
        state
            .pipeline
            .ingest_text(&req.text, req.title.as_deref(), req.source.as_deref()),
    )
    .await?;
    Ok(Json(report))
}

// ============ POST /ingest/file ============

async fn handle_ingest_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<IngestReport>, AppError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut title: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| bad_request("file field must carry a filename"))?;
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("failed to read upload: {}", e)))?;
                file = Some((filename, bytes.to_vec()));
            }
            "title" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| bad_request(format!("invalid title field: {}", e)))?;
                title = Some(text);
            }
            _ => {}
        }
    }

    let (filename, bytes) = file.ok_or_else(|| bad_request("missing multipart field 'file'"))?;
    let report = with_deadline(
        state.request_timeout,
        state
            .pipeline
            .ingest_file(&filename, &bytes, title.as_deref()),
    )
    .await?;
    Ok(Json(report))
}

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    rerank_top_k: Option<usize>,
}

async fn handle_query(
    State(state): State<AppState>,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResult>, AppError> {
    let Json(req) = body.map_err(|e| bad_request(e.body_text()))?;
    let result = with_deadline(
        state.request_timeout,
        state.pipeline.query(&req.query, req.top_k, req.rerank_top_k),
    )
    .await?;
    Ok(Json(result))
}

// ============ DELETE /clear ============

#[derive(Serialize)]
struct ClearResponse {
    cleared: bool,
}

async fn handle_clear(State(state): State<AppState>) -> Result<Json<ClearResponse>, AppError> {
    state.pipeline.clear().await?;
    Ok(Json(ClearResponse { cleared: true }))
}
