use axum::{
    extract::{Path, State},
    Json,
};

use crate::{
    error::{AppError, AppResult},
    models::tenant::{PublicTenant, Tenant},
    AppState,
};

/// Unauthenticated public tenant view, addressed by slug so the SPA can
/// brand its login screen before any credential exists.
pub async fn public_view(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> AppResult<Json<PublicTenant>> {
    let tenant = sqlx::query_as::<_, Tenant>(
        "SELECT * FROM tenants WHERE slug = $1 AND is_active = TRUE",
    )
    .bind(slug.to_lowercase())
    .fetch_optional(&state.db)
    .await?
    .ok_or(AppError::NotFound)?;

    Ok(Json(PublicTenant::from(&tenant)))
}
