use std::time::Duration;

use sqlx::PgPool;

use crate::db;

/// Hourly cycle, per the retention policy.
pub const CYCLE: Duration = Duration::from_secs(3600);

#[derive(Debug, Default)]
pub struct PurgeSummary {
    pub refresh_tokens: u64,
    pub invitations: u64,
    pub verification_tokens: u64,
    pub backup_codes: u64,
}

pub struct Janitor;

impl Janitor {
    /// Delete expired refresh records, expired invitations, expired
    /// verification tokens and consumed recovery codes. Runs on the
    /// without-tenant path because it sweeps every tenant at once.
    pub async fn purge_expired(pool: &PgPool) -> anyhow::Result<PurgeSummary> {
        let mut tx = db::tenant::begin_system_tx(pool).await?;
        let mut summary = PurgeSummary::default();

        summary.refresh_tokens = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < NOW()")
            .execute(&mut *tx)
            .await?
            .rows_affected();

        summary.invitations =
            sqlx::query("DELETE FROM invitations WHERE expires_at < NOW() AND accepted = FALSE")
                .execute(&mut *tx)
                .await?
                .rows_affected();

        summary.verification_tokens =
            sqlx::query("DELETE FROM verification_tokens WHERE expires_at < NOW() OR used = TRUE")
                .execute(&mut *tx)
                .await?
                .rows_affected();

        summary.backup_codes = sqlx::query("DELETE FROM backup_codes WHERE used = TRUE")
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        tracing::info!(
            refresh = summary.refresh_tokens,
            invitations = summary.invitations,
            tokens = summary.verification_tokens,
            codes = summary.backup_codes,
            "janitor cycle complete"
        );
        Ok(summary)
    }

    /// Run forever, one purge per cycle.
    pub async fn run(pool: PgPool) {
        let mut ticker = tokio::time::interval(CYCLE);
        loop {
            ticker.tick().await;
            if let Err(e) = Self::purge_expired(&pool).await {
                tracing::error!("janitor cycle failed: {e}");
            }
        }
    }
}
