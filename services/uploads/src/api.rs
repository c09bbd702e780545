use crate::config::ApiConfig;
use crate::event_bus::{InProcEventBus, UploadEvent, FILE_UPLOADED_TOPIC};
use crate::file_access::{FileAccessError, FileAccessService, SignedFileUrl};
use crate::ingest::{BoxError, IncomingFile, IngestError, IngestService};
use crate::metadata_store::{FileRecord, MetadataError, MetadataRepository};
use crate::principal::Principal;
use crate::query::{PageRequest, PaginatedFiles, QueryError, QueryService, UploadMetrics};
use crate::rate_limit::UploadRateLimiter;
use crate::storage_bridge::{Readiness, StorageBridge, StorageError};
use anyhow::{Context, Result};
use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get},
    Json, Router,
};
use futures::TryStreamExt;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub ingest: IngestService,
    pub queries: Arc<QueryService>,
    pub files: Arc<FileAccessService>,
    pub events: Arc<InProcEventBus<UploadEvent>>,
    pub storage: Arc<StorageBridge>,
    pub metadata: Arc<dyn MetadataRepository>,
    pub upload_limiter: Arc<UploadRateLimiter>,
    /// Request body ceiling, reported back when an upload exceeds it
    pub max_upload_bytes: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: &str) -> Self {
        Self {
            error: error.into(),
            code: code.to_string(),
        }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (status, Json(ErrorResponse::new(error, code)))
}

fn internal_error(e: &dyn std::fmt::Display) -> ApiError {
    error!(error = %e, "Request failed");
    api_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error",
        "INTERNAL_ERROR",
    )
}

fn storage_error(e: StorageError) -> ApiError {
    match e {
        StorageError::Unavailable(_) => api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Object storage is not available",
            "STORAGE_UNAVAILABLE",
        ),
        StorageError::Write { .. } => {
            error!(error = %e, "Object storage write failed");
            api_error(
                StatusCode::BAD_GATEWAY,
                "Failed to write to object storage",
                "STORAGE_WRITE_ERROR",
            )
        }
        StorageError::NotFound(_) => {
            api_error(StatusCode::NOT_FOUND, "Stored object not found", "NOT_FOUND")
        }
        StorageError::Backend(_) => internal_error(&e),
    }
}

fn metadata_error(e: MetadataError) -> ApiError {
    internal_error(&e)
}

impl From<IngestError> for (StatusCode, Json<ErrorResponse>) {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Storage(e) => storage_error(e),
            IngestError::Metadata(e) => metadata_error(e),
            IngestError::Validation(msg) | IngestError::Stream(msg) => {
                api_error(StatusCode::BAD_REQUEST, msg, "VALIDATION_ERROR")
            }
            IngestError::TooLarge(msg) => {
                api_error(StatusCode::PAYLOAD_TOO_LARGE, msg, "PAYLOAD_TOO_LARGE")
            }
            IngestError::Task(_) => internal_error(&e),
        }
    }
}

fn rate_limited(limit: u32, retry_in: Duration) -> Response {
    let retry_secs = (retry_in.as_millis() as u64).div_ceil(1000).max(1);
    let mut response = api_error(
        StatusCode::TOO_MANY_REQUESTS,
        format!("Upload limit reached, retry in {retry_secs}s"),
        "RATE_LIMITED",
    )
    .into_response();

    let headers = response.headers_mut();
    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_secs));
    headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(0u32));
    response
}

/// Map a multipart read failure, telling an exceeded body ceiling apart
/// from a malformed request
fn multipart_error(e: MultipartError, max_bytes: usize) -> IngestError {
    let mut over_limit = e.status() == StatusCode::PAYLOAD_TOO_LARGE;
    let mut source = std::error::Error::source(&e);
    while let (false, Some(inner)) = (over_limit, source) {
        over_limit = inner.to_string().contains("length limit exceeded");
        source = inner.source();
    }

    if over_limit {
        IngestError::TooLarge(format!("request body exceeds {max_bytes} bytes"))
    } else {
        IngestError::Validation(e.body_text())
    }
}

impl From<QueryError> for (StatusCode, Json<ErrorResponse>) {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::InvalidPagination(msg) => {
                api_error(StatusCode::BAD_REQUEST, msg, "VALIDATION_ERROR")
            }
            QueryError::Metadata(e) => metadata_error(e),
        }
    }
}

impl From<FileAccessError> for (StatusCode, Json<ErrorResponse>) {
    fn from(e: FileAccessError) -> Self {
        match e {
            FileAccessError::NotFound { .. } => {
                api_error(StatusCode::NOT_FOUND, e.to_string(), "NOT_FOUND")
            }
            FileAccessError::Storage(e) => storage_error(e),
            FileAccessError::Metadata(e) => metadata_error(e),
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/files", get(list_files).post(upload_file))
        .route("/api/v1/files/metrics", get(upload_metrics))
        .route("/api/v1/files/events", get(file_events))
        .route("/api/v1/files/:file_id", delete(delete_file))
        .route("/api/v1/files/:file_id/url", get(get_signed_url))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "uploads-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.metadata.ping().await;
    let storage = state.storage.readiness();

    let body = serde_json::json!({
        "status": if database.is_ok() && storage == Readiness::Ready { "ready" } else { "not_ready" },
        "database": if database.is_ok() { "connected" } else { "disconnected" },
        "storage": format!("{storage:?}").to_lowercase(),
    });

    if database.is_ok() && storage == Readiness::Ready {
        (StatusCode::OK, Json(body))
    } else {
        if let Err(e) = database {
            warn!(error = %e, "Database not reachable");
        }
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

/// Store the first multipart field of the request as a file
#[instrument(skip(state, multipart), fields(owner_id = principal.id))]
async fn upload_file(
    State(state): State<AppState>,
    principal: Principal,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<FileRecord>), Response> {
    if let Err(retry_in) = state.upload_limiter.check(principal.id).await {
        warn!(owner_id = principal.id, "Upload rate limit exceeded");
        metrics::counter!("uploads.rate_limited").increment(1);
        return Err(rate_limited(state.upload_limiter.limit(), retry_in));
    }

    let max_bytes = state.max_upload_bytes;
    let upload = async {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| multipart_error(e, max_bytes))?
            .ok_or_else(|| IngestError::Validation("Request contains no file".to_string()))?;

        let name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| IngestError::Validation("File field has no file name".to_string()))?;
        // No declared type is stored as an empty string.
        let mime_type = field.content_type().unwrap_or_default().to_string();
        let body = Box::pin(
            field.map_err(move |e| Box::new(multipart_error(e, max_bytes)) as BoxError),
        );

        Ok::<_, IngestError>(IncomingFile::new(name, mime_type, body))
    };

    let record = state
        .ingest
        .ingest(principal.id, upload)
        .await
        .map_err(|e| ApiError::from(e).into_response())?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[instrument(skip(state), fields(owner_id = principal.id))]
async fn list_files(
    State(state): State<AppState>,
    principal: Principal,
    Query(page): Query<PageRequest>,
) -> Result<Json<PaginatedFiles>, ApiError> {
    let files = state.queries.find_user_files(principal.id, Some(page)).await?;
    Ok(Json(files))
}

#[instrument(skip(state), fields(owner_id = principal.id))]
async fn upload_metrics(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<UploadMetrics>, ApiError> {
    let metrics = state.queries.get_user_metrics(principal.id).await?;
    Ok(Json(metrics))
}

#[instrument(skip(state), fields(owner_id = principal.id))]
async fn get_signed_url(
    State(state): State<AppState>,
    principal: Principal,
    Path(file_id): Path<i32>,
) -> Result<Json<SignedFileUrl>, ApiError> {
    let signed = state.files.signed_url(principal.id, file_id).await?;
    Ok(Json(signed))
}

#[instrument(skip(state), fields(owner_id = principal.id))]
async fn delete_file(
    State(state): State<AppState>,
    principal: Principal,
    Path(file_id): Path<i32>,
) -> Result<StatusCode, ApiError> {
    state.files.delete(principal.id, file_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Live stream of the caller's own uploads as Server-Sent Events
async fn file_events(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = state.events.subscribe(FILE_UPLOADED_TOPIC).map_err(|e| {
        api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            e.to_string(),
            "EVENTS_UNAVAILABLE",
        )
    })?;

    info!(owner_id = principal.id, "Upload event stream opened");

    let stream = owner_scoped(events, principal.id).filter_map(|event| {
        match Event::default().event(FILE_UPLOADED_TOPIC).json_data(&event) {
            Ok(sse) => Some(Ok(sse)),
            Err(e) => {
                warn!(error = %e, file_id = event.file.id, "Failed to serialize upload event");
                None
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}

/// Restrict a bus subscription to one owner's uploads
pub fn owner_scoped<S>(events: S, owner_id: i32) -> impl Stream<Item = UploadEvent>
where
    S: Stream<Item = UploadEvent>,
{
    events.filter(move |event| event.owner_id == owner_id)
}

/// Serve the API until `shutdown` fires
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting uploads API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
