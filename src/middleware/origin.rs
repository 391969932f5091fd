use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::AppError;
use crate::middleware::tenant::TenantState;
use crate::AppState;

const ALLOWED_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";
const ALLOWED_HEADERS: &str = "authorization, content-type, x-tenant-id, x-csrf-token";

/// Cross-origin policy. Preflights are answered from the static surface
/// (browsers do not send the tenant header on them); actual requests are
/// admitted only when the Origin is in the bound tenant's allowed set, with
/// a localhost allowance in development.
pub async fn origin_policy(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if req.method() == Method::OPTIONS {
        return preflight_response(origin.as_deref());
    }

    let Some(origin) = origin else {
        // Non-browser caller; nothing to reflect.
        return next.run(req).await;
    };

    let allowed = match req.extensions().get::<TenantState>() {
        Some(ctx) => {
            let guard = ctx.0.lock().await;
            guard.tenant.allowed_origins().iter().any(|o| o == &origin)
                || (state.config.is_development() && is_dev_origin(&origin))
        }
        // Unbound routes (discovery, health) only get the dev allowance.
        None => state.config.is_development() && is_dev_origin(&origin),
    };

    if !allowed {
        return AppError::Forbidden("origin not allowed for this tenant").into_response();
    }

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&origin) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.append(header::VARY, HeaderValue::from_static("Origin"));
    response
}

fn preflight_response(origin: Option<&str>) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    if let Some(origin) = origin {
        if let Ok(value) = HeaderValue::from_str(origin) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOWED_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("600"));
    response
}

pub fn is_dev_origin(origin: &str) -> bool {
    for host in ["http://localhost", "http://127.0.0.1"] {
        if origin == host {
            return true;
        }
        if let Some(rest) = origin.strip_prefix(host) {
            if rest.starts_with(':') {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_allowance_is_localhost_only() {
        assert!(is_dev_origin("http://localhost:3000"));
        assert!(is_dev_origin("http://localhost"));
        assert!(is_dev_origin("http://127.0.0.1:5173"));
        assert!(!is_dev_origin("https://evil.example.com"));
        // A lookalike host must not ride the allowance.
        assert!(!is_dev_origin("http://localhost.evil.com"));
    }
}
