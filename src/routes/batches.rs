use axum::extract::{Path, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::batch::BatchStatus;
use crate::routes::{resolve_session, with_session, ApiError, SessionCookie};
use crate::services::batch_tracker::TrackerObserver;
use crate::services::export;
use crate::services::orchestrator::{BatchError, BatchOptions};

/// Request to process uploaded images as one batch.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct CreateBatchRequest {
    /// Files to include, in order. Omitted means every file in the session.
    #[garde(skip)]
    pub file_ids: Option<Vec<Uuid>>,

    #[garde(range(min = 1, max = 20))]
    pub concurrency: Option<usize>,

    #[garde(skip)]
    pub continue_on_error: Option<bool>,

    #[garde(range(min = 100, max = 300_000))]
    pub timeout_ms: Option<u64>,

    #[garde(range(min = 1, max = 10))]
    pub retry_attempts: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct CreateBatchResponse {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub total: usize,
    pub quota_remaining: usize,
}

/// POST /api/v1/batches — create a batch and process it in the background.
pub async fn create_batch(
    State(state): State<AppState>,
    cookie: SessionCookie,
    Json(request): Json<CreateBatchRequest>,
) -> Result<Response, ApiError> {
    request
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let session_id = resolve_session(&state, cookie).await;
    let files = state
        .sessions
        .select_files(&session_id, request.file_ids.as_deref())
        .await?;
    if files.is_empty() {
        return Err(BatchError::EmptyFileList.into());
    }
    let quota_remaining = state.sessions.reserve_quota(&session_id, files.len()).await?;

    let batch = state.tracker.create_batch(&session_id, &files).await?;
    state.tracker.start_batch(batch.id).await?;

    let options = BatchOptions {
        concurrency: request.concurrency,
        continue_on_error: request.continue_on_error,
        timeout: request.timeout_ms.map(Duration::from_millis),
        retry_attempts: request.retry_attempts,
        on_progress: None,
        observer: Some(Arc::new(TrackerObserver::new(Arc::clone(&state.tracker), batch.id))),
    };

    let processor = state.processor.clone();
    let batch_id = batch.id;
    tokio::spawn(async move {
        if let Err(e) = processor.process_batch(files, options).await {
            tracing::error!(batch_id = %batch_id, error = %e, "Batch processing rejected");
        }
    });

    let response = CreateBatchResponse {
        batch_id,
        status: BatchStatus::Processing,
        total: batch.progress.total,
        quota_remaining,
    };
    Ok(with_session(&state, &session_id, (StatusCode::ACCEPTED, Json(response))))
}

/// GET /api/v1/batches — batches of this session, newest first.
pub async fn list_batches(
    State(state): State<AppState>,
    cookie: SessionCookie,
) -> Result<Response, ApiError> {
    let session_id = resolve_session(&state, cookie).await;
    let batches = state.tracker.list_batches(&session_id).await;
    Ok(with_session(&state, &session_id, Json(batches)))
}

fn batch_not_found() -> ApiError {
    ApiError::NotFound("Batch not found".to_string())
}

/// GET /api/v1/batches/{batch_id} — full per-image status.
pub async fn get_batch(
    State(state): State<AppState>,
    cookie: SessionCookie,
    Path(batch_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let session_id = resolve_session(&state, cookie).await;
    let batch = state
        .tracker
        .get_batch(batch_id, &session_id)
        .await
        .ok_or_else(batch_not_found)?;
    Ok(with_session(&state, &session_id, Json(batch)))
}

/// GET /api/v1/batches/{batch_id}/progress — counters only.
pub async fn get_progress(
    State(state): State<AppState>,
    cookie: SessionCookie,
    Path(batch_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let session_id = resolve_session(&state, cookie).await;
    let progress = state
        .tracker
        .get_progress(batch_id, &session_id)
        .await
        .ok_or_else(batch_not_found)?;
    Ok(with_session(&state, &session_id, Json(progress)))
}

/// GET /api/v1/batches/{batch_id}/export — CSV of completed images.
pub async fn export_batch(
    State(state): State<AppState>,
    cookie: SessionCookie,
    Path(batch_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let session_id = resolve_session(&state, cookie).await;
    let batch = state
        .tracker
        .get_batch(batch_id, &session_id)
        .await
        .ok_or_else(batch_not_found)?;

    let csv = export::batch_to_csv(&batch);
    let disposition = format!("attachment; filename=\"stock-metadata-{batch_id}.csv\"");
    Ok(with_session(
        &state,
        &session_id,
        (
            [
                (CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                (CONTENT_DISPOSITION, disposition),
            ],
            csv,
        ),
    ))
}

/// DELETE /api/v1/batches/{batch_id}
pub async fn delete_batch(
    State(state): State<AppState>,
    cookie: SessionCookie,
    Path(batch_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let session_id = resolve_session(&state, cookie).await;
    if !state.tracker.clear_batch(batch_id, &session_id).await {
        return Err(batch_not_found());
    }
    Ok(with_session(&state, &session_id, StatusCode::NO_CONTENT))
}
