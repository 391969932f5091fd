use sqlx::PgPool;

use crate::models::audit::AuditEvent;
use crate::services::metrics;

/// Persist one audit row through the without-tenant path. Best-effort:
/// failure is logged and swallowed, never propagated to the caller. Callers
/// invoke this only after their business transaction has committed, so a
/// rolled-back action leaves no phantom audit row.
pub async fn record(pool: &PgPool, event: &AuditEvent) {
    let res = sqlx::query(
        "INSERT INTO audit_log
            (tenant_id, action, actor_id, target_id, session_id, metadata,
             ip_address, user_agent, request_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(event.tenant_id)
    .bind(&event.action)
    .bind(event.actor_id)
    .bind(&event.target_id)
    .bind(event.session_id)
    .bind(&event.metadata)
    .bind(&event.ip_address)
    .bind(&event.user_agent)
    .bind(&event.request_id)
    .execute(pool)
    .await;

    if let Err(e) = res {
        metrics::AUDIT_WRITE_FAILURES.inc();
        tracing::warn!(action = %event.action, "audit log insert failed: {e}");
    }
}

/// Fire-and-forget variant for paths with no request to block (worker,
/// detached tasks).
pub fn record_detached(pool: PgPool, event: AuditEvent) {
    tokio::spawn(async move {
        record(&pool, &event).await;
    });
}
