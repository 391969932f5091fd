use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    middleware::{auth::AdminUser, request_id::RequestInfo, tenant::BoundTenant},
    models::{
        audit::{AuditEvent, AuditLogRow},
        user::{AdminUpdateUserRequest, InviteUserRequest, UserRole},
    },
    services::{auth::AuthService, email, encryption},
    AppState,
};

const AUDIT_PAGE_LIMIT_MAX: i64 = 100;
const AUDIT_PAGE_LIMIT_DEFAULT: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, sqlx::FromRow, serde::Serialize)]
struct AdminUserRow {
    id: Uuid,
    email: String,
    full_name: String,
    role: UserRole,
    email_verified: bool,
    totp_enabled: bool,
    is_active: bool,
    created_at: chrono::DateTime<chrono::Utc>,
}

pub async fn list_users(
    BoundTenant(ctx): BoundTenant,
    AdminUser(_admin): AdminUser,
    Query(query): Query<PageQuery>,
) -> AppResult<Json<Value>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let offset = (query.page.unwrap_or(1).max(1) - 1) * limit;

    let mut ctx = ctx.0.lock().await;
    let users = sqlx::query_as::<_, AdminUserRow>(
        "SELECT u.id, u.email, u.full_name, m.role, u.email_verified,
                u.totp_enabled, u.is_active, u.created_at
         FROM users u
         JOIN memberships m ON m.user_id = u.id
         ORDER BY u.created_at DESC
         LIMIT $1 OFFSET $2",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(&mut **ctx.tx()?)
    .await?;

    Ok(Json(json!({ "users": users, "page": query.page.unwrap_or(1), "limit": limit })))
}

pub async fn update_user(
    BoundTenant(ctx): BoundTenant,
    AdminUser(admin): AdminUser,
    Path(user_id): Path<Uuid>,
    Json(body): Json<AdminUpdateUserRequest>,
) -> AppResult<Json<Value>> {
    if user_id == admin.user_id {
        return Err(AppError::Forbidden("administrators cannot modify their own account"));
    }

    let mut ctx = ctx.0.lock().await;
    let tx = ctx.tx()?;

    let target = AuthService::require_user(tx, user_id).await.map_err(|_| AppError::NotFound)?;

    if let Some(role) = body.role {
        let updated = sqlx::query("UPDATE memberships SET role = $1 WHERE user_id = $2")
            .bind(role)
            .bind(target.id)
            .execute(&mut **tx)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(AppError::NotFound);
        }
    }

    if let Some(active) = body.is_active {
        sqlx::query("UPDATE users SET is_active = $1 WHERE id = $2")
            .bind(active)
            .bind(target.id)
            .execute(&mut **tx)
            .await?;
        if !active {
            AuthService::revoke_all_sessions(tx, target.id).await?;
        }
    }

    ctx.audit(
        AuditEvent::new("user.updated")
            .actor(admin.user_id)
            .target(user_id)
            .meta("role", body.role.map(|r| r.to_string()).unwrap_or_default())
            .meta("is_active", json!(body.is_active)),
    );
    Ok(Json(json!({ "message": "User updated" })))
}

/// Removal deactivates the principal and revokes every session; the row is
/// kept for referential integrity of the audit trail.
pub async fn delete_user(
    BoundTenant(ctx): BoundTenant,
    AdminUser(admin): AdminUser,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    if user_id == admin.user_id {
        return Err(AppError::Forbidden("administrators cannot remove their own account"));
    }

    let mut ctx = ctx.0.lock().await;
    let tx = ctx.tx()?;

    let affected = sqlx::query("UPDATE users SET is_active = FALSE WHERE id = $1")
        .bind(user_id)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    if affected == 0 {
        return Err(AppError::NotFound);
    }
    AuthService::revoke_all_sessions(tx, user_id).await?;

    ctx.audit(AuditEvent::new("user.deleted").actor(admin.user_id).target(user_id));
    Ok(Json(json!({ "message": "User removed" })))
}

pub async fn invite_user(
    BoundTenant(ctx): BoundTenant,
    AdminUser(admin): AdminUser,
    Extension(info): Extension<RequestInfo>,
    Json(body): Json<InviteUserRequest>,
) -> AppResult<Json<Value>> {
    let mut ctx = ctx.0.lock().await;
    let tenant = ctx.tenant.clone();
    let invitation_id = AuthService::create_invitation(
        ctx.tx()?,
        &tenant,
        &body.email,
        body.role,
        admin.user_id,
        &info.request_id,
    )
    .await?;

    ctx.audit(
        AuditEvent::new("user.invited")
            .actor(admin.user_id)
            .target(invitation_id)
            .meta("role", body.role.to_string()),
    );
    Ok(Json(json!({ "message": "Invitation sent" })))
}

// ─── Invitations ────────────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow, serde::Serialize)]
struct InvitationRow {
    id: Uuid,
    email: String,
    role: UserRole,
    invited_by: Option<Uuid>,
    expires_at: chrono::DateTime<chrono::Utc>,
    created_at: chrono::DateTime<chrono::Utc>,
}

pub async fn list_invitations(
    BoundTenant(ctx): BoundTenant,
    AdminUser(_admin): AdminUser,
) -> AppResult<Json<Value>> {
    let mut ctx = ctx.0.lock().await;
    let invitations = sqlx::query_as::<_, InvitationRow>(
        "SELECT id, email, role, invited_by, expires_at, created_at
         FROM invitations
         WHERE accepted = FALSE AND expires_at > NOW()
         ORDER BY created_at DESC",
    )
    .fetch_all(&mut **ctx.tx()?)
    .await?;
    Ok(Json(json!({ "invitations": invitations })))
}

pub async fn delete_invitation(
    BoundTenant(ctx): BoundTenant,
    AdminUser(admin): AdminUser,
    Path(invitation_id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    let mut ctx = ctx.0.lock().await;
    let affected = sqlx::query("DELETE FROM invitations WHERE id = $1 AND accepted = FALSE")
        .bind(invitation_id)
        .execute(&mut **ctx.tx()?)
        .await?
        .rows_affected();
    if affected == 0 {
        return Err(AppError::NotFound);
    }
    ctx.audit(AuditEvent::new("invitation.revoked").actor(admin.user_id).target(invitation_id));
    Ok(Json(json!({ "message": "Invitation revoked" })))
}

// ─── Devices ────────────────────────────────────────────────────────────────

/// Device secrets get a moderate work factor: they are high-entropy and
/// verified on every telemetry submission.
const DEVICE_SECRET_COST: u32 = 8;

#[derive(Debug, Deserialize)]
pub struct RegisterDeviceRequest {
    pub hardware_id: String,
    pub name: Option<String>,
}

#[derive(Debug, sqlx::FromRow, serde::Serialize)]
struct DeviceRow {
    id: Uuid,
    hardware_id: String,
    name: String,
    is_active: bool,
    last_heartbeat: Option<chrono::DateTime<chrono::Utc>>,
    created_at: chrono::DateTime<chrono::Utc>,
}

pub async fn list_devices(
    BoundTenant(ctx): BoundTenant,
    AdminUser(_admin): AdminUser,
) -> AppResult<Json<Value>> {
    let mut ctx = ctx.0.lock().await;
    let devices = sqlx::query_as::<_, DeviceRow>(
        "SELECT id, hardware_id, name, is_active, last_heartbeat, created_at
         FROM devices
         ORDER BY created_at DESC",
    )
    .fetch_all(&mut **ctx.tx()?)
    .await?;
    Ok(Json(json!({ "devices": devices })))
}

/// Register a device and hand back its shared secret exactly once; only the
/// hash is stored.
pub async fn register_device(
    BoundTenant(ctx): BoundTenant,
    AdminUser(admin): AdminUser,
    Json(body): Json<RegisterDeviceRequest>,
) -> AppResult<Json<Value>> {
    let hardware_id = body.hardware_id.trim();
    if hardware_id.is_empty() {
        return Err(AppError::Validation("hardware_id is required".into()));
    }

    let (secret, _) = crate::services::auth::generate_opaque_token();
    let secret_hash =
        bcrypt::hash(&secret, DEVICE_SECRET_COST).map_err(|e| AppError::Internal(e.into()))?;

    let mut ctx = ctx.0.lock().await;
    let tenant_id = ctx.tenant.id;
    let device_id: Uuid = sqlx::query_scalar(
        "INSERT INTO devices (tenant_id, hardware_id, secret_hash, name)
         VALUES ($1, $2, $3, $4)
         RETURNING id",
    )
    .bind(tenant_id)
    .bind(hardware_id)
    .bind(&secret_hash)
    .bind(body.name.as_deref().unwrap_or(hardware_id))
    .fetch_one(&mut **ctx.tx()?)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            AppError::Conflict("a device with this hardware id already exists".into())
        }
        _ => AppError::Database(e),
    })?;

    ctx.audit(AuditEvent::new("device.registered").actor(admin.user_id).target(device_id));
    Ok(Json(json!({ "device_id": device_id, "secret": secret })))
}

pub async fn delete_device(
    BoundTenant(ctx): BoundTenant,
    AdminUser(admin): AdminUser,
    Path(device_id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    let mut ctx = ctx.0.lock().await;
    let affected = sqlx::query("DELETE FROM devices WHERE id = $1")
        .bind(device_id)
        .execute(&mut **ctx.tx()?)
        .await?
        .rows_affected();
    if affected == 0 {
        return Err(AppError::NotFound);
    }
    ctx.audit(AuditEvent::new("device.deleted").actor(admin.user_id).target(device_id));
    Ok(Json(json!({ "message": "Device removed" })))
}

// ─── Tenant settings ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct UpdateTenantRequest {
    pub name: Option<String>,
    pub branding: Option<Value>,
    pub allowed_origins: Option<Vec<String>>,
    pub public_registration: Option<bool>,
    pub app_base_url: Option<String>,
}

pub async fn tenant_settings(
    BoundTenant(ctx): BoundTenant,
    AdminUser(_admin): AdminUser,
) -> AppResult<Json<Value>> {
    let ctx = ctx.0.lock().await;
    let t = &ctx.tenant;
    Ok(Json(json!({
        "id": t.id,
        "slug": t.slug,
        "name": t.name,
        "branding": t.branding,
        "allowed_origins": t.allowed_origins,
        "public_registration": t.allows_public_registration(),
        "app_base_url": t.app_base_url,
    })))
}

pub async fn update_tenant_settings(
    BoundTenant(ctx): BoundTenant,
    AdminUser(admin): AdminUser,
    Json(body): Json<UpdateTenantRequest>,
) -> AppResult<Json<Value>> {
    if let Some(origins) = &body.allowed_origins {
        for origin in origins {
            crate::models::tenant::validate_allowed_origin(origin).map_err(AppError::Validation)?;
        }
    }

    let mut ctx = ctx.0.lock().await;
    let tenant_id = ctx.tenant.id;
    let tx = ctx.tx()?;

    if let Some(name) = body.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        sqlx::query("UPDATE tenants SET name = $2 WHERE id = $1")
            .bind(tenant_id)
            .bind(name)
            .execute(&mut **tx)
            .await?;
    }
    if let Some(branding) = &body.branding {
        sqlx::query("UPDATE tenants SET branding = $2 WHERE id = $1")
            .bind(tenant_id)
            .bind(branding)
            .execute(&mut **tx)
            .await?;
    }
    if let Some(origins) = &body.allowed_origins {
        sqlx::query("UPDATE tenants SET allowed_origins = $2 WHERE id = $1")
            .bind(tenant_id)
            .bind(json!(origins))
            .execute(&mut **tx)
            .await?;
    }
    if let Some(open) = body.public_registration {
        sqlx::query(
            "UPDATE tenants
             SET settings = jsonb_set(settings, '{public_registration}', to_jsonb($2::boolean))
             WHERE id = $1",
        )
        .bind(tenant_id)
        .bind(open)
        .execute(&mut **tx)
        .await?;
    }
    if let Some(url) = body.app_base_url.as_deref().map(str::trim) {
        sqlx::query("UPDATE tenants SET app_base_url = $2 WHERE id = $1")
            .bind(tenant_id)
            .bind(url)
            .execute(&mut **tx)
            .await?;
    }

    ctx.audit(AuditEvent::new("tenant.settings_updated").actor(admin.user_id).target(tenant_id));
    Ok(Json(json!({ "message": "Tenant settings updated" })))
}

// ─── Outbound-mail configuration ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct MailConfigRequest {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

pub async fn get_mail_config(
    BoundTenant(ctx): BoundTenant,
    AdminUser(_admin): AdminUser,
) -> AppResult<Json<Value>> {
    let ctx = ctx.0.lock().await;
    let tenant = &ctx.tenant;
    if !tenant.has_mail_config() {
        return Ok(Json(json!({ "configured": false })));
    }
    Ok(Json(json!({
        "configured": true,
        "host": tenant.smtp_host,
        "port": tenant.smtp_port,
        "username": tenant.smtp_username,
        "from": tenant.smtp_from,
        "key_version": tenant.smtp_key_version,
    })))
}

pub async fn set_mail_config(
    State(state): State<AppState>,
    BoundTenant(ctx): BoundTenant,
    AdminUser(admin): AdminUser,
    Json(body): Json<MailConfigRequest>,
) -> AppResult<Json<Value>> {
    // Config-time egress check; the worker re-validates before every send.
    email::validate_smtp_host(&body.host, body.port)
        .await
        .map_err(AppError::Validation)?;

    let version = &state.config.tenant_secret_current;
    let master = state
        .config
        .tenant_secret_keys
        .get(version)
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("no tenant secret key configured")))?;

    let mut ctx = ctx.0.lock().await;
    let tenant_id = ctx.tenant.id;
    let key = encryption::derive_tenant_key(master, tenant_id)?;
    let (ciphertext, nonce) = encryption::encrypt_secret(body.password.as_bytes(), &key)?;

    sqlx::query(
        "UPDATE tenants
         SET smtp_host = $2, smtp_port = $3, smtp_username = $4,
             smtp_password_enc = $5, smtp_password_nonce = $6,
             smtp_key_version = $7, smtp_from = $8
         WHERE id = $1",
    )
    .bind(tenant_id)
    .bind(&body.host)
    .bind(body.port as i32)
    .bind(&body.username)
    .bind(&ciphertext)
    .bind(&nonce)
    .bind(version)
    .bind(&body.from)
    .execute(&mut **ctx.tx()?)
    .await?;

    ctx.audit(AuditEvent::new("mailconfig.updated").actor(admin.user_id).meta("host", body.host));
    Ok(Json(json!({ "message": "Mail configuration saved" })))
}

pub async fn delete_mail_config(
    BoundTenant(ctx): BoundTenant,
    AdminUser(admin): AdminUser,
) -> AppResult<Json<Value>> {
    let mut ctx = ctx.0.lock().await;
    let tenant_id = ctx.tenant.id;
    sqlx::query(
        "UPDATE tenants
         SET smtp_host = NULL, smtp_port = NULL, smtp_username = NULL,
             smtp_password_enc = NULL, smtp_password_nonce = NULL,
             smtp_key_version = NULL, smtp_from = NULL
         WHERE id = $1",
    )
    .bind(tenant_id)
    .execute(&mut **ctx.tx()?)
    .await?;

    ctx.audit(AuditEvent::new("mailconfig.deleted").actor(admin.user_id));
    Ok(Json(json!({ "message": "Mail configuration removed" })))
}

/// Delivery statistics from the outbox and the pseudonymised delivery log.
/// These are system tables, so the tenant filter is explicit.
pub async fn email_stats(
    BoundTenant(ctx): BoundTenant,
    AdminUser(_admin): AdminUser,
) -> AppResult<Json<Value>> {
    let mut ctx = ctx.0.lock().await;
    let tenant_id = ctx.tenant.id;
    let tx = ctx.tx()?;

    let outbox: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::TEXT, COUNT(*)::BIGINT FROM email_outbox
         WHERE tenant_id = $1 GROUP BY status",
    )
    .bind(tenant_id)
    .fetch_all(&mut **tx)
    .await?;

    let delivered: i64 = sqlx::query_scalar(
        "SELECT COUNT(*)::BIGINT FROM email_log WHERE tenant_id = $1 AND status = 'sent'",
    )
    .bind(tenant_id)
    .fetch_one(&mut **tx)
    .await?;

    let mut by_status = serde_json::Map::new();
    for (status, count) in outbox {
        by_status.insert(status, json!(count));
    }

    Ok(Json(json!({ "outbox": by_status, "delivered": delivered })))
}

pub async fn audit_logs(
    BoundTenant(ctx): BoundTenant,
    AdminUser(_admin): AdminUser,
    Query(query): Query<PageQuery>,
) -> AppResult<Json<Value>> {
    let limit = query
        .limit
        .unwrap_or(AUDIT_PAGE_LIMIT_DEFAULT)
        .clamp(1, AUDIT_PAGE_LIMIT_MAX);
    let page = query.page.unwrap_or(1).max(1);
    let offset = (page - 1) * limit;

    let mut ctx = ctx.0.lock().await;
    let entries = sqlx::query_as::<_, AuditLogRow>(
        "SELECT id, action, actor_id, target_id, session_id, metadata,
                ip_address, user_agent, request_id, created_at
         FROM audit_log
         ORDER BY created_at DESC
         LIMIT $1 OFFSET $2",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(&mut **ctx.tx()?)
    .await?;

    Ok(Json(json!({ "entries": entries, "page": page, "limit": limit })))
}
