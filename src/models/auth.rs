use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::user::UserRole;

pub const SCOPE_ACCESS: &str = "access";
pub const SCOPE_PRE_AUTH: &str = "pre_auth";

/// Claims embedded in the short-lived access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub tenant: String,
    pub role: UserRole,
    pub scope: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

/// Claims embedded in the pre-auth token that authorises exactly one
/// second-factor attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreAuthClaims {
    pub sub: String,
    pub scope: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

/// Extracted from a validated access token — available via axum extractors.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub role: UserRole,
}

/// Extracted from a validated pre-auth token.
#[derive(Debug, Clone)]
pub struct PreAuthPrincipal {
    pub user_id: Uuid,
}
