use axum::Json;

use crate::services::categories::{Category, CATEGORIES};

/// GET /api/v1/categories — the marketplace category table.
pub async fn list_categories() -> Json<&'static [Category]> {
    Json(CATEGORIES)
}
