use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::AppState;

/// Per-request correlator and caller identity, resolved once at the top of
/// the chain and carried through request extensions.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub request_id: String,
    pub ip: String,
    pub user_agent: String,
}

/// Assign the request id and resolve the real client address. Forwarding
/// headers are honoured only when the deployment declares a trusted proxy
/// in front of the service.
pub async fn request_context(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let ip = resolve_real_ip(req.headers(), peer, state.config.trust_proxy_headers);

    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    req.extensions_mut().insert(RequestInfo {
        request_id: request_id.clone(),
        ip,
        user_agent,
    });

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// First X-Forwarded-For hop, then X-Real-IP, then the socket peer. Spoofed
/// forwarding headers from untrusted clients are ignored.
pub fn resolve_real_ip(headers: &HeaderMap, peer: Option<IpAddr>, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| v.parse::<IpAddr>().is_ok())
        {
            return forwarded.to_string();
        }
        if let Some(real) = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| v.parse::<IpAddr>().is_ok())
        {
            return real.to_string();
        }
    }
    peer.map(|ip| ip.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                v.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn forwarded_header_wins_behind_a_trusted_proxy() {
        let h = headers(&[("x-forwarded-for", "203.0.113.7, 10.0.0.1")]);
        let peer = Some("10.0.0.1".parse().unwrap());
        assert_eq!(resolve_real_ip(&h, peer, true), "203.0.113.7");
    }

    #[test]
    fn forwarded_header_is_ignored_without_trust() {
        let h = headers(&[("x-forwarded-for", "203.0.113.7")]);
        let peer = Some("198.51.100.2".parse().unwrap());
        assert_eq!(resolve_real_ip(&h, peer, false), "198.51.100.2");
    }

    #[test]
    fn garbage_forwarded_values_fall_through() {
        let h = headers(&[("x-forwarded-for", "not-an-ip"), ("x-real-ip", "192.0.2.9")]);
        let peer = Some("198.51.100.2".parse().unwrap());
        assert_eq!(resolve_real_ip(&h, peer, true), "192.0.2.9");
    }
}
