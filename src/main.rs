use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatehouse_api::{
    app,
    config::Config,
    db,
    middleware::rate_limit::RateLimiter,
    services::{devices::DeviceGateway, tokens::TokenService},
    AppState,
};

/// In-flight handlers get this long to finish their transactions after a
/// termination signal before the pool is closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(20);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);
    if let Some(dsn) = &config.sentry_dsn {
        info!("crash reporter DSN configured ({} chars)", dsn.len());
    }

    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    info!("database connected and migrations applied");

    let tokens = Arc::new(TokenService::new(&config)?);
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_per_second,
        config.rate_limit_burst,
    ));
    limiter.spawn_eviction();

    let state = AppState {
        db: pool.clone(),
        config: config.clone(),
        tokens,
        limiter,
        devices: Arc::new(DeviceGateway::new(&config)),
    };

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("identity service listening on {addr}");

    axum::serve(
        listener,
        app::router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Give straggling transactions up to the grace period to hand their
    // connections back, then drop the pool regardless.
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, pool.close()).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received; draining in-flight requests");
}
