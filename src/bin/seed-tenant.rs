/// Operator tool: create a tenant and its first administrator.
///
/// Usage: seed-tenant --slug acme --name "Acme Corp" \
///          --email admin@acme.example --password "..." \
///          --origin https://app.acme.example [--public-registration]
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use gatehouse_api::models::tenant::validate_allowed_origin;

#[derive(Parser)]
#[command(name = "seed-tenant", about = "Create a tenant with an admin principal")]
struct Args {
    #[arg(long)]
    slug: String,

    #[arg(long)]
    name: String,

    /// Admin email (created verified)
    #[arg(long)]
    email: String,

    #[arg(long)]
    password: String,

    /// Allowed browser origin; repeatable
    #[arg(long)]
    origin: Vec<String>,

    /// SPA base URL used in outgoing email links
    #[arg(long, default_value = "")]
    app_base_url: String,

    #[arg(long)]
    public_registration: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    for origin in &args.origin {
        validate_allowed_origin(origin).map_err(|e| anyhow::anyhow!(e))?;
    }

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable not set"))?;
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url)
        .await?;

    let settings = serde_json::json!({ "public_registration": args.public_registration });
    let origins = serde_json::json!(args.origin);

    let tenant_id: Uuid = sqlx::query_scalar(
        "INSERT INTO tenants (slug, name, allowed_origins, settings, app_base_url)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING id",
    )
    .bind(args.slug.to_lowercase())
    .bind(&args.name)
    .bind(&origins)
    .bind(&settings)
    .bind(&args.app_base_url)
    .fetch_one(&pool)
    .await?;

    let password_hash = bcrypt::hash(&args.password, 12)?;
    let user_id: Uuid = sqlx::query_scalar(
        "INSERT INTO users (tenant_id, email, password_hash, full_name, email_verified)
         VALUES ($1, $2, $3, 'Administrator', TRUE)
         RETURNING id",
    )
    .bind(tenant_id)
    .bind(args.email.to_lowercase())
    .bind(&password_hash)
    .fetch_one(&pool)
    .await?;

    sqlx::query("INSERT INTO memberships (user_id, tenant_id, role) VALUES ($1, $2, 'admin')")
        .bind(user_id)
        .bind(tenant_id)
        .execute(&pool)
        .await?;

    tracing::info!("created tenant {} ({tenant_id}) with admin {user_id}", args.slug);
    println!("{tenant_id}");
    Ok(())
}
