use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::Response,
    Json,
};

use crate::{
    error::AppResult,
    middleware::tenant::BoundTenant,
    models::device::TelemetryRequest,
    AppState,
};

/// Telemetry submission from shared-secret devices. The external response is
/// passed back verbatim; forward failures surface as 502.
pub async fn submit_telemetry(
    State(state): State<AppState>,
    BoundTenant(ctx): BoundTenant,
    Json(body): Json<TelemetryRequest>,
) -> AppResult<Response> {
    let mut ctx = ctx.0.lock().await;
    let tenant_id = ctx.tenant.id;
    let forwarded = state
        .devices
        .submit(ctx.tx()?, &state.db, tenant_id, &body)
        .await?;

    Ok(Response::builder()
        .status(StatusCode::from_u16(forwarded.status).unwrap_or(StatusCode::OK))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(forwarded.body.to_string()))
        .unwrap_or_default())
}
