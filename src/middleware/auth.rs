use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::tenant::TenantState;
use crate::models::auth::{AuthenticatedUser, PreAuthPrincipal};
use crate::models::user::UserRole;
use crate::AppState;

/// Extract a named cookie value from request headers.
pub fn get_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    headers
        .get(header::COOKIE)?
        .to_str()
        .ok()?
        .split(';')
        .find_map(|part| {
            let part = part.trim();
            part.strip_prefix(&prefix).map(str::to_string)
        })
}

/// The bearer token, from the Authorization header or the access cookie set
/// at login.
fn access_token(parts: &Parts) -> Option<String> {
    if let Some(token) = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(token.to_string());
    }
    get_cookie(&parts.headers, "access_token")
}

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    /// Validate the bearer as scope `access`. When the request carries a
    /// tenant binding, the token's tenant must match it exactly.
    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = access_token(parts).ok_or(AppError::InvalidCredentials)?;
        let claims = state.tokens.verify_access(&token)?;

        let user_id: Uuid = claims.sub.parse().map_err(|_| AppError::InvalidCredentials)?;
        let token_tenant: Uuid = claims.tenant.parse().map_err(|_| AppError::InvalidCredentials)?;

        if let Some(bound) = parts.extensions.get::<TenantState>() {
            let bound_tenant = bound.0.lock().await.tenant.id;
            if bound_tenant != token_tenant {
                return Err(AppError::Forbidden("token is not valid for this tenant"));
            }
        }

        Ok(AuthenticatedUser {
            user_id,
            tenant_id: token_tenant,
            role: claims.role,
        })
    }
}

impl FromRequestParts<AppState> for PreAuthPrincipal {
    type Rejection = AppError;

    /// Validate the bearer as scope `pre_auth`; an access token here is a
    /// scope confusion and fails uniformly.
    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = access_token(parts).ok_or(AppError::InvalidCredentials)?;
        let claims = state.tokens.verify_pre_auth(&token)?;
        let user_id: Uuid = claims.sub.parse().map_err(|_| AppError::InvalidCredentials)?;
        Ok(PreAuthPrincipal { user_id })
    }
}

/// Role gate: admits any principal whose role weight is at least admin's.
pub struct AdminUser(pub AuthenticatedUser);

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let user = AuthenticatedUser::from_request_parts(parts, state).await?;
        if !user.role.at_least(UserRole::Admin) {
            return Err(AppError::Forbidden("admin role required"));
        }
        Ok(AdminUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_extraction_handles_multiple_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "csrf_token=abc; access_token=xyz; refresh_token=r1".parse().unwrap(),
        );
        assert_eq!(get_cookie(&headers, "access_token").as_deref(), Some("xyz"));
        assert_eq!(get_cookie(&headers, "refresh_token").as_deref(), Some("r1"));
        assert_eq!(get_cookie(&headers, "missing"), None);
    }
}
