//! HTTP surface: upload, status polling, download and discard.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, State, multipart::MultipartError},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::converters::StyleConfig;
use crate::error::{Error, TaskError, ValidationError};
use crate::service::ConversionService;
use crate::tasks::{ConversionType, Submission};

/// Conversion used when an upload names none.
const DEFAULT_CONVERSION: &str = "pdf-to-word";
/// Room for multipart framing and the text fields on top of the file itself.
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

/// Build the router for the conversion API.
pub fn conversion_routes(service: Arc<ConversionService>) -> Router {
    let body_limit = service.config().max_upload_bytes + MULTIPART_OVERHEAD;

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/upload", post(upload).layer(DefaultBodyLimit::max(body_limit)))
        .route("/status/{task_id}", get(status))
        .route("/download/{task_id}", get(download))
        .route("/tasks/{task_id}", delete(discard))
        .route("/style-config", get(style_config))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

/// Handler error rendered as `{"error": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        let status = match e {
            TaskError::NotFound { .. } | TaskError::NotReady { .. } => StatusCode::NOT_FOUND,
            TaskError::StillActive { .. } => StatusCode::CONFLICT,
        };
        Self::new(status, e.to_string())
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, e.to_string())
    }
}

/// Body-limit hits are rejected uploads like any other, so they answer 400.
fn multipart_error(e: MultipartError) -> ApiError {
    match e.status() {
        StatusCode::PAYLOAD_TOO_LARGE => ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("Upload exceeds the size limit: {}", e.body_text()),
        ),
        status => ApiError::new(status, e.body_text()),
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::Validation(e) => e.into(),
            Error::Task(e) => e.into(),
            other => {
                error!(error = %other, "Request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        }
    }
}

/// Malformed ids can never name a task.
fn parse_task_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| {
        ApiError::new(StatusCode::NOT_FOUND, format!("Task {raw} not found"))
    })
}

// ── Service info ────────────────────────────────────────────────────────

async fn index() -> impl IntoResponse {
    Json(json!({
        "message": "Document conversion service",
        "version": env!("CARGO_PKG_VERSION"),
        "conversion_types": ConversionType::ALL.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
    }))
}

async fn health(State(service): State<Arc<ConversionService>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "docconv",
        "tasks": service.tasks().len(),
    }))
}

async fn style_config() -> impl IntoResponse {
    Json(StyleConfig::default())
}

// ── Tasks ───────────────────────────────────────────────────────────────

async fn upload(
    State(service): State<Arc<ConversionService>>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut conversion_type: Option<String> = None;
    let mut style: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(multipart_error)?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(multipart_error)?;
                file = Some((file_name, bytes.to_vec()));
            }
            "conversion_type" => {
                conversion_type = Some(
                    field
                        .text()
                        .await
                        .map_err(multipart_error)?,
                );
            }
            "style_config" => {
                style = Some(
                    field
                        .text()
                        .await
                        .map_err(multipart_error)?,
                );
            }
            other => debug!(field = other, "Ignoring unknown form field"),
        }
    }

    let (file_name, content) = file.ok_or(ValidationError::MissingField("file"))?;
    if file_name.is_empty() {
        return Err(ValidationError::Malformed("file part has no file name".to_string()).into());
    }
    let conversion_type = conversion_type
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CONVERSION.to_string());

    let task_id = service
        .submit(Submission {
            conversion_type,
            file_name,
            content,
            style,
        })
        .await?;
    info!(task_id = %task_id, "Upload accepted");

    Ok(Json(json!({
        "task_id": task_id,
        "status": "pending",
        "message": "File uploaded, conversion started",
    })))
}

async fn status(
    State(service): State<Arc<ConversionService>>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    Ok(Json(service.status(task_id)?))
}

async fn download(
    State(service): State<Arc<ConversionService>>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    let download = service.download(task_id).await?;

    let headers = [
        (
            header::CONTENT_TYPE,
            HeaderValue::from_static(download.content_type),
        ),
        (
            header::CONTENT_DISPOSITION,
            content_disposition(&download.file_name),
        ),
    ];
    Ok((headers, download.bytes).into_response())
}

async fn discard(
    State(service): State<Arc<ConversionService>>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task_id = parse_task_id(&task_id)?;
    service.discard(task_id).await?;
    Ok(Json(json!({ "task_id": task_id, "status": "discarded" })))
}

/// `attachment` disposition with an ASCII fallback name and an RFC 5987
/// UTF-8 name for everything else.
fn content_disposition(file_name: &str) -> HeaderValue {
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut value = format!("attachment; filename=\"{fallback}\"");
    if !file_name.is_ascii() {
        value.push_str("; filename*=UTF-8''");
        value.push_str(&percent_encode(file_name));
    }
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len() * 3);
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || b"-._~".contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
