use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::services::metrics;

/// Application error taxonomy. Components return the kind plus an internal
/// cause; the HTTP layer maps kinds to status codes. Detail beyond the kind
/// never flows to the client.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Umbrella for unknown principal, wrong password, wrong second factor,
    /// unknown refresh token, wrong pre-auth scope. Uniform to the client.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Second-factor code did not verify. Counted separately, but rendered
    /// with the same body as InvalidCredentials.
    #[error("invalid second-factor code")]
    InvalidCode,

    #[error("tenant binding missing or unknown")]
    TenantRequired,

    /// The presented refresh token was revoked within the grace window;
    /// the client should retry with the newest token it holds.
    #[error("concurrent refresh")]
    ConcurrentRefresh,

    /// Refresh-token reuse detected; the whole family has been revoked.
    #[error("refresh token reuse detected")]
    SecurityAlert,

    #[error("public registration is disabled for this tenant")]
    PublicRegistrationDisabled,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found")]
    NotFound,

    #[error("upstream failure: {0}")]
    BadGateway(String),

    #[error("database error")]
    Database(#[from] sqlx::Error),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message, code) = match &self {
            AppError::InvalidCredentials => {
                (StatusCode::UNAUTHORIZED, "Invalid credentials", "INVALID_CREDENTIALS")
            }
            // Same external shape as InvalidCredentials; only the metric differs.
            AppError::InvalidCode => {
                metrics::MFA_FAILURES.inc();
                (StatusCode::UNAUTHORIZED, "Invalid credentials", "INVALID_CREDENTIALS")
            }
            AppError::TenantRequired => {
                (StatusCode::BAD_REQUEST, "Tenant identification required", "TENANT_REQUIRED")
            }
            AppError::ConcurrentRefresh => {
                (StatusCode::UNAUTHORIZED, "Refresh already in progress", "CONCURRENT_REFRESH")
            }
            AppError::SecurityAlert => (
                StatusCode::UNAUTHORIZED,
                "Session revoked for security reasons",
                "SECURITY_ALERT",
            ),
            AppError::PublicRegistrationDisabled => (
                StatusCode::FORBIDDEN,
                "Public registration is disabled",
                "REGISTRATION_DISABLED",
            ),
            AppError::Validation(msg) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": msg, "code": "VALIDATION_ERROR" })),
                )
                    .into_response();
            }
            AppError::Forbidden(msg) => {
                return (
                    StatusCode::FORBIDDEN,
                    Json(json!({ "error": msg, "code": "FORBIDDEN" })),
                )
                    .into_response();
            }
            AppError::Conflict(msg) => {
                return (
                    StatusCode::CONFLICT,
                    Json(json!({ "error": msg, "code": "CONFLICT" })),
                )
                    .into_response();
            }
            AppError::NotFound => (StatusCode::NOT_FOUND, "Not found", "NOT_FOUND"),
            AppError::BadGateway(msg) => {
                tracing::warn!("upstream failure: {msg}");
                (StatusCode::BAD_GATEWAY, "Upstream service failure", "BAD_GATEWAY")
            }
            AppError::Database(e) => {
                tracing::error!("database error: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", "INTERNAL")
            }
            AppError::Internal(e) => {
                tracing::error!("internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error", "INTERNAL")
            }
        };

        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_of(err: AppError) -> (StatusCode, serde_json::Value) {
        let resp = err.into_response();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), 1024).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn credential_failures_share_one_body() {
        let (s1, b1) = body_of(AppError::InvalidCredentials).await;
        let (s2, b2) = body_of(AppError::InvalidCode).await;
        assert_eq!(s1, StatusCode::UNAUTHORIZED);
        assert_eq!(s1, s2);
        assert_eq!(b1, b2);
    }

    #[tokio::test]
    async fn refresh_failure_modes_are_distinguishable() {
        let (s1, b1) = body_of(AppError::ConcurrentRefresh).await;
        let (s2, b2) = body_of(AppError::SecurityAlert).await;
        assert_eq!(s1, StatusCode::UNAUTHORIZED);
        assert_eq!(s2, StatusCode::UNAUTHORIZED);
        assert_ne!(b1["code"], b2["code"]);
    }

    #[tokio::test]
    async fn internal_detail_never_reaches_the_client() {
        let (_, body) = body_of(AppError::Internal(anyhow::anyhow!("pg password=hunter2"))).await;
        assert_eq!(body["error"], "Internal server error");
    }
}
