use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tokio::sync::RwLock;

use crate::middleware::request_id::RequestInfo;
use crate::AppState;

/// Entries idle longer than this are dropped by the eviction sweep.
const MAX_IDLE: Duration = Duration::from_secs(600);
const EVICTION_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-address token bucket. The only process-level mutable state besides
/// the pool and the issuer; guarded by an async RwLock around the map.
pub struct RateLimiter {
    rate_per_sec: f64,
    burst: f64,
    buckets: RwLock<HashMap<IpAddr, Bucket>>,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self {
            rate_per_sec,
            burst,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Take one token for `ip`; false means the caller is over budget.
    pub async fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.write().await;
        let bucket = buckets.entry(ip).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub async fn evict_idle(&self, max_idle: Duration) {
        let now = Instant::now();
        let mut buckets = self.buckets.write().await;
        buckets.retain(|_, b| now.duration_since(b.last_refill) < max_idle);
    }

    pub async fn tracked_addresses(&self) -> usize {
        self.buckets.read().await.len()
    }

    /// Periodic sweep so one-off callers do not accumulate forever.
    pub fn spawn_eviction(self: &Arc<Self>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
            loop {
                ticker.tick().await;
                limiter.evict_idle(MAX_IDLE).await;
            }
        });
    }
}

/// Middleware: 429 when the caller's bucket is empty.
pub async fn limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let ip = req
        .extensions()
        .get::<RequestInfo>()
        .and_then(|info| info.ip.parse::<IpAddr>().ok());

    if let Some(ip) = ip {
        if !state.limiter.check(ip).await {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": "Too many requests", "code": "RATE_LIMITED" })),
            )
                .into_response();
        }
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_is_honoured_then_exhausted() {
        let limiter = RateLimiter::new(5.0, 10.0);
        let ip: IpAddr = "203.0.113.1".parse().unwrap();
        for i in 0..10 {
            assert!(limiter.check(ip).await, "request {i} should pass the burst");
        }
        assert!(!limiter.check(ip).await, "11th immediate request must be limited");
    }

    #[tokio::test]
    async fn addresses_are_limited_independently() {
        let limiter = RateLimiter::new(5.0, 1.0);
        let a: IpAddr = "203.0.113.1".parse().unwrap();
        let b: IpAddr = "203.0.113.2".parse().unwrap();
        assert!(limiter.check(a).await);
        assert!(!limiter.check(a).await);
        assert!(limiter.check(b).await);
    }

    #[tokio::test]
    async fn idle_entries_are_evicted() {
        let limiter = RateLimiter::new(5.0, 10.0);
        let ip: IpAddr = "203.0.113.3".parse().unwrap();
        limiter.check(ip).await;
        assert_eq!(limiter.tracked_addresses().await, 1);
        limiter.evict_idle(Duration::ZERO).await;
        assert_eq!(limiter.tracked_addresses().await, 0);
    }
}
