pub mod batches;
pub mod categories;
pub mod health;
pub mod metrics;
pub mod session;
pub mod temp;
pub mod uploads;

use axum::extract::{DefaultBodyLimit, FromRequestParts};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::services::batch_tracker::TrackerError;
use crate::services::orchestrator::BatchError;
use crate::services::session::{SessionError, SESSION_COOKIE};
use crate::services::uploads::UploadError;

/// Assemble the HTTP API. `/metrics` is mounted only when a Prometheus
/// handle is supplied.
pub fn build_router(state: AppState, prometheus: Option<Arc<PrometheusHandle>>) -> Router {
    let max_upload_bytes = state.config.max_upload_bytes;
    let metrics_state = prometheus.map(|handle| metrics::MetricsState {
        handle,
        stager: Arc::clone(&state.stager),
    });

    let app = Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/session", get(session::session_info))
        .route("/api/v1/categories", get(categories::list_categories))
        .route(
            "/api/v1/uploads",
            post(uploads::upload_images).get(uploads::list_uploads),
        )
        .route("/api/v1/uploads/{file_id}", delete(uploads::delete_upload))
        .route(
            "/api/v1/uploads/{file_id}/process",
            post(uploads::process_upload),
        )
        .route(
            "/api/v1/batches",
            post(batches::create_batch).get(batches::list_batches),
        )
        .route(
            "/api/v1/batches/{batch_id}",
            get(batches::get_batch).delete(batches::delete_batch),
        )
        .route("/api/v1/batches/{batch_id}/progress", get(batches::get_progress))
        .route("/api/v1/batches/{batch_id}/export", get(batches::export_batch))
        .route("/temp/{name}", get(temp::serve_temp))
        .with_state(state);

    let app = match metrics_state {
        Some(metrics_state) => app.route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(metrics_state),
        ),
        None => app,
    };

    app.layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
}

/// Session id from the request's cookie, if it sent one.
pub struct SessionCookie(pub Option<String>);

impl<S: Send + Sync> FromRequestParts<S> for SessionCookie {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(cookie_value(&parts.headers, SESSION_COOKIE)))
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Resolve (or start) the caller's session, deleting uploads left behind by
/// an expired one.
pub async fn resolve_session(state: &AppState, cookie: SessionCookie) -> String {
    let (session_id, orphaned) = state.sessions.resolve(cookie.0.as_deref()).await;
    if !orphaned.is_empty() {
        state.uploads.delete_all(&orphaned).await;
    }
    session_id
}

/// Attach the session cookie to a response.
pub fn with_session(state: &AppState, session_id: &str, response: impl IntoResponse) -> Response {
    let cookie = format!(
        "{SESSION_COOKIE}={session_id}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        state.config.session_ttl_secs
    );
    ([(SET_COOKIE, cookie)], response).into_response()
}

/// Error returned by route handlers, rendered as `{"error", "message"}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("{0}")]
    UnsupportedMediaType(String),

    #[error("{0}")]
    QuotaExceeded(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::PayloadTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large"),
            ApiError::UnsupportedMediaType(_) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_media_type")
            }
            ApiError::QuotaExceeded(_) => (StatusCode::TOO_MANY_REQUESTS, "quota_exceeded"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = serde_json::json!({ "error": code, "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound | SessionError::FileNotFound(_) => ApiError::NotFound(e.to_string()),
            SessionError::DuplicateFile(_) => ApiError::BadRequest(e.to_string()),
            SessionError::QuotaExceeded { .. } => ApiError::QuotaExceeded(e.to_string()),
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::Empty(_) => ApiError::BadRequest(e.to_string()),
            UploadError::TooLarge { .. } => ApiError::PayloadTooLarge(e.to_string()),
            UploadError::UnsupportedFormat(_) => ApiError::UnsupportedMediaType(e.to_string()),
            UploadError::Io { .. } => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<BatchError> for ApiError {
    fn from(e: BatchError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<TrackerError> for ApiError {
    fn from(e: TrackerError) -> Self {
        match e {
            TrackerError::NotFound(_) => ApiError::NotFound("Batch not found".to_string()),
            TrackerError::DuplicateImage(_) => ApiError::BadRequest(e.to_string()),
            _ => ApiError::Internal(e.to_string()),
        }
    }
}
