pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

use std::sync::Arc;

use sqlx::PgPool;

/// Application state shared across all handlers. The pool, the limiter table
/// and the credential issuer are the only process-level shared objects.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<config::Config>,
    pub tokens: Arc<services::tokens::TokenService>,
    pub limiter: Arc<middleware::rate_limit::RateLimiter>,
    pub devices: Arc<services::devices::DeviceGateway>,
}
