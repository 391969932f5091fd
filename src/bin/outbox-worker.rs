/// Asynchronous email delivery worker. Runs as its own process next to the
/// API: claims pending outbox rows, delivers them over SMTP and schedules
/// retries with exponential backoff.
///
/// Usage: outbox-worker [--batch-size N] [--interval SECONDS]
use std::time::Duration;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use gatehouse_api::config::Config;
use gatehouse_api::services::outbox::{self, WorkerConfig};

#[derive(Parser)]
#[command(name = "outbox-worker", about = "Deliver queued emails from the outbox")]
struct Args {
    /// Maximum rows claimed per cycle
    #[arg(long, default_value_t = 25)]
    batch_size: i64,

    /// Seconds between claim cycles
    #[arg(long, default_value_t = 30)]
    interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;

    outbox::run(
        pool,
        config,
        WorkerConfig {
            poll_interval: Duration::from_secs(args.interval),
            batch_size: args.batch_size,
        },
    )
    .await;

    Ok(())
}
