use axum::{
    extract::{Path, State},
    Extension, Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    middleware::{request_id::RequestInfo, tenant::BoundTenant},
    models::{
        audit::AuditEvent,
        auth::AuthenticatedUser,
        user::{ChangeEmailRequest, ChangePasswordRequest, UpdateProfileRequest, UserProfile, VerifyEmailRequest},
    },
    services::auth::AuthService,
    AppState,
};

pub async fn me(
    BoundTenant(ctx): BoundTenant,
    user: AuthenticatedUser,
) -> AppResult<Json<Value>> {
    let mut ctx = ctx.0.lock().await;
    let tenant = ctx.tenant.clone();
    let account = AuthService::require_user(ctx.tx()?, user.user_id).await?;
    let role = AuthService::role_of(ctx.tx()?, user.user_id)
        .await?
        .ok_or(AppError::InvalidCredentials)?;

    let mut profile = serde_json::to_value(UserProfile::from(&account)).unwrap_or_default();
    if let Value::Object(map) = &mut profile {
        map.insert("role".into(), json!(role));
    }

    Ok(Json(json!({
        "user": profile,
        "tenant": { "id": tenant.id, "slug": tenant.slug, "name": tenant.name },
    })))
}

pub async fn list_sessions(
    BoundTenant(ctx): BoundTenant,
    user: AuthenticatedUser,
) -> AppResult<Json<Value>> {
    let mut ctx = ctx.0.lock().await;
    let sessions = AuthService::list_sessions(ctx.tx()?, user.user_id).await?;
    Ok(Json(json!({ "sessions": sessions })))
}

pub async fn revoke_session(
    BoundTenant(ctx): BoundTenant,
    user: AuthenticatedUser,
    Path(session_id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    let mut ctx = ctx.0.lock().await;
    let revoked = AuthService::revoke_session(ctx.tx()?, user.user_id, session_id).await?;
    if !revoked {
        return Err(AppError::NotFound);
    }
    ctx.audit(
        AuditEvent::new("session.revoked")
            .actor(user.user_id)
            .session(session_id),
    );
    Ok(Json(json!({ "message": "Session revoked" })))
}

pub async fn update_profile(
    BoundTenant(ctx): BoundTenant,
    user: AuthenticatedUser,
    Json(body): Json<UpdateProfileRequest>,
) -> AppResult<Json<Value>> {
    let Some(full_name) = body.full_name.filter(|n| !n.trim().is_empty()) else {
        return Err(AppError::Validation("full_name is required".into()));
    };

    let mut ctx = ctx.0.lock().await;
    let updated = AuthService::update_profile(ctx.tx()?, user.user_id, &full_name).await?;
    ctx.audit(AuditEvent::new("profile.updated").actor(user.user_id).target(user.user_id));
    Ok(Json(json!({ "user": UserProfile::from(&updated) })))
}

/// Password change with current-password proof; revokes every session the
/// principal owns, including the one making this request.
pub async fn change_password(
    State(state): State<AppState>,
    BoundTenant(ctx): BoundTenant,
    user: AuthenticatedUser,
    Json(body): Json<ChangePasswordRequest>,
) -> AppResult<Json<Value>> {
    let mut ctx = ctx.0.lock().await;
    AuthService::change_password(
        ctx.tx()?,
        &state.config,
        user.user_id,
        &body.current_password,
        &body.new_password,
    )
    .await?;
    ctx.audit(AuditEvent::new("password.changed").actor(user.user_id).target(user.user_id));
    Ok(Json(json!({ "message": "Password updated; all sessions revoked" })))
}

pub async fn request_email_change(
    BoundTenant(ctx): BoundTenant,
    user: AuthenticatedUser,
    Extension(info): Extension<RequestInfo>,
    Json(body): Json<ChangeEmailRequest>,
) -> AppResult<Json<Value>> {
    let mut ctx = ctx.0.lock().await;
    let tenant = ctx.tenant.clone();
    AuthService::request_email_change(
        ctx.tx()?,
        &tenant,
        user.user_id,
        &body.new_email,
        &body.password,
        &info.request_id,
    )
    .await?;
    ctx.audit(AuditEvent::new("email.change_requested").actor(user.user_id).target(user.user_id));
    Ok(Json(json!({ "message": "Confirmation email sent to the new address" })))
}

pub async fn confirm_email_change(
    BoundTenant(ctx): BoundTenant,
    user: AuthenticatedUser,
    Json(body): Json<VerifyEmailRequest>,
) -> AppResult<Json<Value>> {
    let mut ctx = ctx.0.lock().await;
    let changed_user = AuthService::confirm_email_change(ctx.tx()?, &body.token).await?;
    if changed_user != user.user_id {
        return Err(AppError::InvalidCredentials);
    }
    ctx.audit(AuditEvent::new("email.changed").actor(user.user_id).target(user.user_id));
    Ok(Json(json!({ "message": "Email updated" })))
}
