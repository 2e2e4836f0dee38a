use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::backend::{Session, SharedSession};
use crate::board::PhotoView;
use crate::error::PipelineError;
use crate::model::{PhotoFile, PhotoId};
use crate::pipeline::{UploadPipeline, UploadSettings};
use crate::config;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub cfg: config::SharedConfig,
    pub pipeline: Arc<UploadPipeline>,
    pub session: Arc<SharedSession>,
}

#[derive(Debug)]
pub enum ApiError {
    Pipeline(PipelineError),
    Status(StatusCode),
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        ApiError::Pipeline(e)
    }
}

impl From<StatusCode> for ApiError {
    fn from(s: StatusCode) -> Self {
        ApiError::Status(s)
    }
}

pub fn status_for(e: &PipelineError) -> StatusCode {
    match e {
        PipelineError::SessionMissing => StatusCode::UNAUTHORIZED,
        PipelineError::PhotoNotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::Busy(_)
        | PipelineError::NothingToRetry(_)
        | PipelineError::InvalidTransition(_)
        | PipelineError::Cancelled => StatusCode::CONFLICT,
        PipelineError::Transport(_)
        | PipelineError::Rejected { .. }
        | PipelineError::Exhausted { .. } => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Pipeline(e) => {
                (status_for(&e), Json(json!({ "error": e.to_string() }))).into_response()
            }
            ApiError::Status(s) => s.into_response(),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
pub struct SessionUpdate {
    pub access_token: String,
}

#[derive(Deserialize)]
pub struct PhotoUpdate {
    pub description: String,
}

#[derive(Deserialize)]
pub struct UploadConfigUpdate {
    #[serde(default)]
    pub compress_threshold_bytes: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub max_width: Option<u32>,
    #[serde(default)]
    pub max_height: Option<u32>,
    #[serde(default)]
    pub jpeg_quality: Option<u8>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub signed_in: bool,
    pub queued: usize,
    pub busy: bool,
}

// Logs all 4xx/5xx responses with method, URI, status and latency.
async fn log_error_responses(req: axum::extract::Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let start = Instant::now();
    let res = next.run(req).await;
    let status = res.status();
    if status.is_server_error() {
        tracing::error!(%method, %uri, %status, elapsed_ms = start.elapsed().as_millis(), "http 5xx");
    } else if status.is_client_error() {
        tracing::warn!(%method, %uri, %status, elapsed_ms = start.elapsed().as_millis(), "http 4xx");
    }
    res
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO))
        .on_failure(DefaultOnFailure::new().level(Level::ERROR));

    let api = Router::new()
        .route("/health", get(health))
        .route("/session", put(put_session).delete(delete_session))
        .route("/config", get(get_config))
        .route("/config/upload", patch(patch_upload_config))
        .route(
            "/reports/{id}/photos",
            get(list_photos)
                .post(create_photo)
                .layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/photos/{id}/file",
            put(put_photo_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/photos/{id}", patch(patch_photo).delete(delete_photo))
        .route("/photos/{id}/cancel", post(cancel_photo))
        .route("/photos/{id}/retry", post(retry_photo))
        .with_state(state)
        .layer(cors)
        .layer(trace)
        .layer(middleware::from_fn(log_error_responses));

    Router::new().nest("/api", api)
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        signed_in: state.session.is_signed_in(),
        queued: state.pipeline.queue_len(),
        busy: state.pipeline.is_busy(),
    })
}

pub async fn put_session(
    State(state): State<AppState>,
    Json(payload): Json<SessionUpdate>,
) -> StatusCode {
    if payload.access_token.trim().is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    state.session.set(Session {
        access_token: payload.access_token,
    });
    tracing::info!("session set");
    StatusCode::NO_CONTENT
}

pub async fn delete_session(State(state): State<AppState>) -> StatusCode {
    state.session.clear();
    tracing::info!("session cleared; uploads paused");
    StatusCode::NO_CONTENT
}

pub async fn get_config(State(state): State<AppState>) -> Result<Json<config::Config>, StatusCode> {
    config::ConfigManager::to_struct(&state.cfg)
        .await
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Tune upload settings, persist them, and apply them to new tasks.
pub async fn patch_upload_config(
    State(state): State<AppState>,
    Json(payload): Json<UploadConfigUpdate>,
) -> Result<Json<config::Config>, StatusCode> {
    if payload.compress_threshold_bytes.is_some() || payload.max_attempts.is_some() {
        config::ConfigManager::update_upload(
            &state.cfg,
            payload.compress_threshold_bytes,
            payload.max_attempts,
        )
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    }
    if payload.max_width.is_some() || payload.max_height.is_some() || payload.jpeg_quality.is_some()
    {
        config::ConfigManager::update_image_limits(
            &state.cfg,
            payload.max_width,
            payload.max_height,
            payload.jpeg_quality,
        )
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    }
    config::ConfigManager::save(&state.cfg)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let cfg = config::ConfigManager::to_struct(&state.cfg)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    state
        .pipeline
        .update_settings(UploadSettings::from_config(&cfg));
    Ok(Json(cfg))
}

pub async fn list_photos(
    Path(report_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<PhotoView>>> {
    Ok(Json(state.pipeline.open_report(&report_id).await?))
}

struct UploadForm {
    file: Option<PhotoFile>,
    description: Option<String>,
}

async fn read_upload_form(mut multipart: Multipart) -> Result<UploadForm, StatusCode> {
    let mut form = UploadForm {
        file: None,
        description: None,
    };
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?
    {
        let name = field.name().map(|s| s.to_string());
        match name.as_deref() {
            Some("file") => {
                let file_name = field.file_name().unwrap_or("photo").to_string();
                let content_type = field.content_type().map(|s| s.to_string());
                let bytes = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;
                let file = PhotoFile::new(file_name, content_type, bytes);
                if !file.is_empty() {
                    form.file = Some(file);
                }
            }
            Some("description") => {
                form.description = Some(field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?);
            }
            _ => {}
        }
    }
    Ok(form)
}

fn current_view(state: &AppState, id: PhotoId) -> ApiResult<Json<PhotoView>> {
    state
        .pipeline
        .view(id)
        .map(Json)
        .ok_or(ApiError::Pipeline(PipelineError::PhotoNotFound(id)))
}

/// Add a photo slot; an attached `file` part is queued right away.
pub async fn create_photo(
    Path(report_id): Path<String>,
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<PhotoView>)> {
    let form = read_upload_form(multipart).await?;
    let id = match form.file {
        Some(file) => {
            state
                .pipeline
                .attach_photo(&report_id, file, form.description)
                .await?
        }
        None => state.pipeline.add_photo(&report_id, form.description).record.id,
    };
    Ok((StatusCode::CREATED, current_view(&state, id)?))
}

/// Select or replace the file; also how a failed photo is retried with a new file.
pub async fn put_photo_file(
    Path(id): Path<PhotoId>,
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<PhotoView>)> {
    let form = read_upload_form(multipart).await?;
    let file = form.file.ok_or(StatusCode::BAD_REQUEST)?;
    state.pipeline.select_file(id, file).await?;
    if let Some(text) = form.description {
        state.pipeline.update_description(id, &text).await?;
    }
    Ok((StatusCode::ACCEPTED, current_view(&state, id)?))
}

pub async fn patch_photo(
    Path(id): Path<PhotoId>,
    State(state): State<AppState>,
    Json(payload): Json<PhotoUpdate>,
) -> ApiResult<Json<PhotoView>> {
    state
        .pipeline
        .update_description(id, &payload.description)
        .await?;
    current_view(&state, id)
}

pub async fn cancel_photo(
    Path(id): Path<PhotoId>,
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let cancelled = state.pipeline.cancel(id)?;
    Ok(Json(json!({ "cancelled": cancelled })))
}

pub async fn retry_photo(
    Path(id): Path<PhotoId>,
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<PhotoView>)> {
    state.pipeline.retry(id)?;
    Ok((StatusCode::ACCEPTED, current_view(&state, id)?))
}

pub async fn delete_photo(
    Path(id): Path<PhotoId>,
    State(state): State<AppState>,
) -> ApiResult<StatusCode> {
    state.pipeline.remove(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Serve the HTTP API. If `bind` is Some it is parsed as a socket address, otherwise
/// defaults to 0.0.0.0:8080.
pub async fn serve(app: Router, bind: Option<String>) -> anyhow::Result<()> {
    let bind_addr = bind.unwrap_or_else(|| "0.0.0.0:8080".to_string());
    let addr: SocketAddr = bind_addr.parse()?;
    tracing::info!(addr=%addr, "starting http server");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{InvalidTransition, UploadEvent, UploadStatus};

    #[test]
    fn pipeline_errors_map_to_statuses() {
        let id = PhotoId::new();
        assert_eq!(status_for(&PipelineError::SessionMissing), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&PipelineError::PhotoNotFound(id)), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&PipelineError::Busy(id)), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&PipelineError::InvalidTransition(InvalidTransition {
                from: UploadStatus::Done,
                event: UploadEvent::Start,
            })),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&PipelineError::Rejected {
                status: 403,
                body: "denied".into()
            }),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn pipeline_error_body_carries_message() {
        let res = ApiError::from(PipelineError::SessionMissing).into_response();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let res = ApiError::from(StatusCode::BAD_REQUEST).into_response();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}
