use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{request::Parts, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sqlx::{Postgres, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db;
use crate::error::{AppError, AppResult};
use crate::middleware::request_id::RequestInfo;
use crate::models::audit::AuditEvent;
use crate::models::tenant::Tenant;
use crate::services::audit;
use crate::AppState;

pub const TENANT_HEADER: &str = "x-tenant-id";

/// Everything a handler needs from the tenant binding: the tenant row, the
/// open tenant-scoped transaction, and the audit entries accumulated during
/// the request (flushed only after a successful commit).
pub struct TenantContext {
    pub tenant: Tenant,
    tx: Option<Transaction<'static, Postgres>>,
    audit: Vec<AuditEvent>,
}

impl TenantContext {
    pub fn tx(&mut self) -> AppResult<&mut Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("tenant transaction already closed")))
    }

    /// Queue an audit event; it is written through the without-tenant path
    /// after the business transaction commits, so a rollback leaves no
    /// phantom row.
    pub fn audit(&mut self, event: AuditEvent) {
        self.audit.push(event);
    }
}

#[derive(Clone)]
pub struct TenantState(pub Arc<Mutex<TenantContext>>);

/// Extractor for handlers that require a tenant binding.
pub struct BoundTenant(pub TenantState);

impl<S: Send + Sync> FromRequestParts<S> for BoundTenant {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TenantState>()
            .cloned()
            .map(BoundTenant)
            .ok_or(AppError::TenantRequired)
    }
}

/// Open the tenant-scoped transaction for the request and settle it from the
/// response outcome: commit iff the status is below 400, roll back otherwise.
///
/// The binding comes from `X-Tenant-ID` (400 on malformed UUID); when the
/// header is absent but a valid access token is supplied, the token's tenant
/// becomes the binding. Preflight requests cannot carry the header and pass
/// through unbound.
pub async fn bind_tenant(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        return next.run(req).await;
    }

    let tenant_id = match resolve_tenant_id(&state, &req) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    let Some(tenant_id) = tenant_id else {
        return next.run(req).await;
    };

    let tenant = match sqlx::query_as::<_, Tenant>(
        "SELECT * FROM tenants WHERE id = $1 AND is_active = TRUE",
    )
    .bind(tenant_id)
    .fetch_optional(&state.db)
    .await
    {
        Ok(Some(tenant)) => tenant,
        // Unknown tenant is indistinguishable from a missing binding.
        Ok(None) => return AppError::TenantRequired.into_response(),
        Err(e) => return AppError::Database(e).into_response(),
    };

    let tx = match db::tenant::begin_tenant_tx(&state.db, tenant.id).await {
        Ok(tx) => tx,
        Err(e) => {
            return AppError::Internal(anyhow::anyhow!("failed to bind tenant transaction: {e}"))
                .into_response()
        }
    };

    let request_info = req.extensions().get::<RequestInfo>().cloned();
    let ctx = TenantState(Arc::new(Mutex::new(TenantContext {
        tenant,
        tx: Some(tx),
        audit: Vec::new(),
    })));
    req.extensions_mut().insert(ctx.clone());

    let response = next.run(req).await;

    let mut guard = ctx.0.lock().await;
    let tenant_id = guard.tenant.id;
    let tx = guard.tx.take();
    let events: Vec<AuditEvent> = guard.audit.drain(..).collect();
    drop(guard);

    let committed = match tx {
        Some(tx) if response.status().as_u16() < 400 => match tx.commit().await {
            Ok(()) => true,
            Err(e) => {
                // A handler must never report success after a rollback.
                return AppError::Internal(anyhow::anyhow!("tenant transaction commit failed: {e}"))
                    .into_response();
            }
        },
        Some(tx) => {
            if let Err(e) = tx.rollback().await {
                tracing::warn!("tenant transaction rollback failed: {e}");
            }
            false
        }
        None => false,
    };

    if committed {
        for mut event in events {
            event.tenant_id = Some(tenant_id);
            if let Some(info) = &request_info {
                event.ip_address = info.ip.clone();
                event.user_agent = info.user_agent.clone();
                event.request_id = info.request_id.clone();
            }
            audit::record(&state.db, &event).await;
        }
    }

    response
}

fn resolve_tenant_id(state: &AppState, req: &Request) -> Result<Option<Uuid>, AppError> {
    if let Some(raw) = req.headers().get(TENANT_HEADER).and_then(|v| v.to_str().ok()) {
        let id = raw
            .trim()
            .parse::<Uuid>()
            .map_err(|_| AppError::Validation("malformed tenant id".into()))?;
        return Ok(Some(id));
    }

    // No header: a valid access token (bearer or cookie) binds its own
    // tenant.
    if let Some(token) = bearer_token(req) {
        if let Ok(claims) = state.tokens.verify_access(&token) {
            if let Ok(id) = claims.tenant.parse::<Uuid>() {
                return Ok(Some(id));
            }
        }
    }
    Ok(None)
}

fn bearer_token(req: &Request) -> Option<String> {
    if let Some(token) = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(token.to_string());
    }
    crate::middleware::auth::get_cookie(req.headers(), "access_token")
}
