/// Periodic purge of expired tokens, invitations and consumed recovery
/// codes. Runs hourly as its own process, or once with --once (e.g. from an
/// external scheduler).
use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use gatehouse_api::services::janitor::Janitor;

#[derive(Parser)]
#[command(name = "janitor", about = "Purge expired identity-service state")]
struct Args {
    /// Run a single purge cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable not set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url)
        .await?;

    if args.once {
        Janitor::purge_expired(&pool).await?;
        return Ok(());
    }

    Janitor::run(pool).await;
    Ok(())
}
