use axum::{extract::State, http::StatusCode, response::Response, Extension, Json};
use serde_json::{json, Value};

use crate::{
    error::{AppError, AppResult},
    middleware::{request_id::RequestInfo, tenant::BoundTenant},
    models::{
        audit::AuditEvent,
        auth::{AuthenticatedUser, PreAuthPrincipal},
        user::{MfaActivateRequest, MfaCodeRequest},
    },
    routes::auth::json_with_cookies,
    services::{
        auth::AuthService,
        twofactor::{TwoFactorService, RECOVERY_CODE_COUNT},
    },
    AppState,
};

/// Complete login with a time-based code. Bearer must be a pre-auth claim;
/// an access token here fails on scope.
pub async fn verify(
    State(state): State<AppState>,
    BoundTenant(ctx): BoundTenant,
    principal: PreAuthPrincipal,
    Extension(info): Extension<RequestInfo>,
    Json(body): Json<MfaCodeRequest>,
) -> AppResult<Response> {
    let mut ctx = ctx.0.lock().await;
    let session = AuthService::complete_totp(
        ctx.tx()?,
        &state.tokens,
        &state.config,
        principal.user_id,
        &body.code,
        &info.ip,
        &info.user_agent,
    )
    .await?;

    ctx.audit(
        AuditEvent::new("login.success")
            .actor(session.user.id)
            .session(session.session_id)
            .meta("method", "mfa_totp"),
    );

    let cookies = super::auth::session_cookies(&session);
    Ok(json_with_cookies(StatusCode::OK, &super::auth::session_body(&session), &cookies))
}

/// Complete login with a single-use recovery code.
pub async fn backup(
    State(state): State<AppState>,
    BoundTenant(ctx): BoundTenant,
    principal: PreAuthPrincipal,
    Extension(info): Extension<RequestInfo>,
    Json(body): Json<MfaCodeRequest>,
) -> AppResult<Response> {
    let mut ctx = ctx.0.lock().await;
    let session = AuthService::complete_backup_code(
        ctx.tx()?,
        &state.tokens,
        &state.config,
        principal.user_id,
        &body.code,
        &info.ip,
        &info.user_agent,
    )
    .await?;

    ctx.audit(
        AuditEvent::new("login.success")
            .actor(session.user.id)
            .session(session.session_id)
            .meta("method", "mfa_backup_code"),
    );

    let cookies = super::auth::session_cookies(&session);
    Ok(json_with_cookies(StatusCode::OK, &super::auth::session_body(&session), &cookies))
}

/// Begin enrolment: fresh secret, QR image and the one-shot cleartext
/// recovery codes. Nothing is persisted until activation proves possession.
pub async fn setup(
    BoundTenant(ctx): BoundTenant,
    user: AuthenticatedUser,
) -> AppResult<Json<Value>> {
    let mut ctx = ctx.0.lock().await;
    let tenant_name = ctx.tenant.name.clone();
    let account = AuthService::require_user(ctx.tx()?, user.user_id).await?;

    let enrolment = TwoFactorService::begin_enrolment(&tenant_name, &account.email)?;
    Ok(Json(json!({
        "secret": enrolment.secret,
        "qr_png": enrolment.qr_png,
        "backup_codes": enrolment.backup_codes,
    })))
}

/// Activate the second factor: the submitted code must verify against the
/// submitted secret, then secret and hashed recovery codes are persisted.
pub async fn activate(
    BoundTenant(ctx): BoundTenant,
    user: AuthenticatedUser,
    Json(body): Json<MfaActivateRequest>,
) -> AppResult<Json<Value>> {
    if body.backup_codes.len() != RECOVERY_CODE_COUNT {
        return Err(AppError::Validation(format!(
            "exactly {RECOVERY_CODE_COUNT} backup codes are required"
        )));
    }
    if !TwoFactorService::verify_code(&body.secret, &body.code) {
        return Err(AppError::InvalidCode);
    }

    let mut ctx = ctx.0.lock().await;
    let tenant_id = ctx.tenant.id;
    let tx = ctx.tx()?;

    sqlx::query("UPDATE users SET totp_secret = $1, totp_enabled = TRUE WHERE id = $2")
        .bind(&body.secret)
        .bind(user.user_id)
        .execute(&mut **tx)
        .await?;

    // Re-enrolment invalidates any previous recovery codes.
    sqlx::query("DELETE FROM backup_codes WHERE user_id = $1")
        .bind(user.user_id)
        .execute(&mut **tx)
        .await?;

    for code in &body.backup_codes {
        let hash = TwoFactorService::hash_backup_code(code)?;
        sqlx::query(
            "INSERT INTO backup_codes (user_id, tenant_id, code_hash) VALUES ($1, $2, $3)",
        )
        .bind(user.user_id)
        .bind(tenant_id)
        .bind(&hash)
        .execute(&mut **tx)
        .await?;
    }

    ctx.audit(AuditEvent::new("mfa.enabled").actor(user.user_id).target(user.user_id));
    Ok(Json(json!({ "message": "Second factor enabled" })))
}
