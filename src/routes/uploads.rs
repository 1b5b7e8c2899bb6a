use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::upload::UploadedFile;
use crate::routes::{resolve_session, with_session, ApiError, SessionCookie};

#[derive(Debug, Serialize)]
pub struct RejectedUpload {
    pub filename: String,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub files: Vec<UploadedFile>,
    pub rejected: Vec<RejectedUpload>,
}

/// POST /api/v1/uploads — store one or more images (multipart field `images`).
pub async fn upload_images(
    State(state): State<AppState>,
    cookie: SessionCookie,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let session_id = resolve_session(&state, cookie).await;
    let mut files = Vec::new();
    let mut rejected = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed multipart body: {e}")))?
    {
        if !matches!(field.name(), Some("images") | Some("image")) {
            continue;
        }
        let filename = field.file_name().unwrap_or("image").to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to read {filename}: {e}")))?;

        match state.uploads.save(&filename, &data).await {
            Ok(file) => files.push(file),
            Err(e) => {
                tracing::info!(filename = %filename, error = %e, "Rejected upload");
                rejected.push(RejectedUpload {
                    filename,
                    reason: e.to_string(),
                });
            }
        }
    }

    if files.is_empty() && rejected.is_empty() {
        return Err(ApiError::BadRequest("No images in request".to_string()));
    }

    state.sessions.add_files(&session_id, files.clone()).await?;
    tracing::info!(session_id = %session_id, accepted = files.len(), rejected = rejected.len(), "Upload complete");

    let status = if files.is_empty() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::CREATED
    };
    Ok(with_session(&state, &session_id, (status, Json(UploadResponse { files, rejected }))))
}

/// GET /api/v1/uploads — files uploaded in this session.
pub async fn list_uploads(
    State(state): State<AppState>,
    cookie: SessionCookie,
) -> Result<Response, ApiError> {
    let session_id = resolve_session(&state, cookie).await;
    let files = state.sessions.files(&session_id).await?;
    Ok(with_session(&state, &session_id, Json(files)))
}

/// DELETE /api/v1/uploads/{file_id}
pub async fn delete_upload(
    State(state): State<AppState>,
    cookie: SessionCookie,
    Path(file_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let session_id = resolve_session(&state, cookie).await;
    let file = state.sessions.remove_file(&session_id, file_id).await?;
    state.uploads.delete(&file).await?;
    Ok(with_session(&state, &session_id, StatusCode::NO_CONTENT))
}

/// POST /api/v1/uploads/{file_id}/process — run one image synchronously.
pub async fn process_upload(
    State(state): State<AppState>,
    cookie: SessionCookie,
    Path(file_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let session_id = resolve_session(&state, cookie).await;
    let file = state.sessions.file(&session_id, file_id).await?;
    state.sessions.reserve_quota(&session_id, 1).await?;

    let result = state.processor.process_image(&file).await;
    Ok(with_session(&state, &session_id, Json(result)))
}
