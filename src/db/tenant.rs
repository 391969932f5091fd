use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

/// Open a tenant-scoped transaction: the first statement binds the tenant id
/// to the transaction-local setting consumed by the row-level policies.
///
/// If `set_config` fails the transaction is dropped (rolled back) and the
/// error propagates; a handler must never observe a half-bound transaction.
pub async fn begin_tenant_tx(
    pool: &PgPool,
    tenant_id: Uuid,
) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT set_config('app.current_tenant', $1, true)")
        .bind(tenant_id.to_string())
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

/// Open a transaction with no tenant binding. Only the audit writer, the
/// janitor and the outbox worker use this path; against the row-level
/// policies an unbound transaction sees zero rows in tenant-scoped tables,
/// so these callers must run with the privileged store role.
pub async fn begin_system_tx(
    pool: &PgPool,
) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
    pool.begin().await
}
