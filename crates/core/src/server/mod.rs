use std::sync::Arc;

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::config::{AppConfig, LimitsConfig};
use crate::error::DehazeError;
use crate::model::{ModelInfo, OnnxDehazeModel};
use crate::pipeline::DehazePipeline;

/// Multipart field the upload is expected in.
pub const UPLOAD_FIELD: &str = "file";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    pipeline: DehazePipeline,
    limiter: Option<Arc<Semaphore>>,
    max_upload_bytes: usize,
}

impl AppState {
    pub fn new(pipeline: DehazePipeline, limits: &LimitsConfig) -> Self {
        let limiter = match limits.max_concurrent_requests {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };

        Self {
            inner: Arc::new(AppStateInner {
                pipeline,
                limiter,
                max_upload_bytes: limits.max_upload_bytes,
            }),
        }
    }
}

/// Load the model named in `config` and wrap it for serving.
pub fn app_state_with_config(config: &AppConfig) -> Result<AppState, DehazeError> {
    let model = OnnxDehazeModel::load(&config.model)?;
    let pipeline = DehazePipeline::new(Arc::new(model), config.model.input_size);
    Ok(AppState::new(pipeline, &config.limits))
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    let max_upload_bytes = state.inner.max_upload_bytes;

    Router::new()
        .route("/dehaze", post(dehaze))
        .route("/api/health", get(health))
        .route("/api/model", get(model_info))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn model_info(State(state): State<AppState>) -> Json<ModelInfo> {
    Json(state.inner.pipeline.model_info())
}

async fn api_route_not_found() -> AppError {
    AppError::NotFound("unknown API route".to_string())
}

// ─── Dehaze ──────────────────────────────────────────────────────────────────

struct Upload {
    file_name: Option<String>,
    bytes: Vec<u8>,
}

async fn dehaze(State(state): State<AppState>, multipart: Multipart) -> Result<Response, AppError> {
    let request_id = Uuid::new_v4();
    let span = info_span!("dehaze", %request_id);
    dehaze_upload(state, multipart).instrument(span).await
}

async fn dehaze_upload(state: AppState, mut multipart: Multipart) -> Result<Response, AppError> {
    let upload = read_upload(&mut multipart).await?;
    info!(
        file_name = upload.file_name.as_deref().unwrap_or("<unnamed>"),
        upload_bytes = upload.bytes.len(),
        "Received upload"
    );

    let _permit = match &state.inner.limiter {
        Some(limiter) => Some(
            limiter
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| AppError::Internal("request limiter closed".to_string()))?,
        ),
        None => None,
    };

    let pipeline = state.inner.pipeline.clone();
    let span = Span::current();
    let output = tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        pipeline.run(&upload.bytes)
    })
    .await
    .map_err(|e| AppError::Internal(format!("task join error: {e}")))??;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "image/png")],
        output.png,
    )
        .into_response())
}

/// Pull the image out of the form: the `file` field if present, otherwise the
/// first field that carries a filename.
async fn read_upload(multipart: &mut Multipart) -> Result<Upload, AppError> {
    while let Some(field) = multipart.next_field().await.map_err(AppError::from)? {
        if is_upload_field(&field) {
            let file_name = field.file_name().map(ToString::to_string);
            let bytes = field.bytes().await.map_err(AppError::from)?;
            return Ok(Upload {
                file_name,
                bytes: bytes.to_vec(),
            });
        }
    }

    Err(AppError::BadRequest(format!(
        "multipart body has no '{UPLOAD_FIELD}' field"
    )))
}

fn is_upload_field(field: &Field<'_>) -> bool {
    field.name() == Some(UPLOAD_FIELD) || field.file_name().is_some()
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    PayloadTooLarge(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<DehazeError> for AppError {
    fn from(err: DehazeError) -> Self {
        if err.is_client_error() {
            warn!(error = %err, "Rejected upload");
            AppError::BadRequest(err.to_string())
        } else {
            error!(error = %err, "Dehaze request failed");
            AppError::Internal(err.to_string())
        }
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        let message = err.body_text();
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge(message)
        } else {
            AppError::BadRequest(message)
        }
    }
}
