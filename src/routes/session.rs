use axum::extract::State;
use axum::response::Response;
use axum::Json;

use crate::app_state::AppState;
use crate::routes::{resolve_session, with_session, ApiError, SessionCookie};

/// GET /api/v1/session — quota and upload count for the caller's session.
pub async fn session_info(
    State(state): State<AppState>,
    cookie: SessionCookie,
) -> Result<Response, ApiError> {
    let session_id = resolve_session(&state, cookie).await;
    let summary = state.sessions.summary(&session_id).await?;
    Ok(with_session(&state, &session_id, Json(summary)))
}
