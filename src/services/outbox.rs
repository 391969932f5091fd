use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::error::{AppError, AppResult};
use crate::models::outbox::{EmailPayload, OutboxItem};
use crate::models::tenant::Tenant;
use crate::services::email::{self, EmailTemplate};
use crate::services::metrics;

/// Exponential backoff baseline: 5, 10, 20 minutes.
pub fn backoff(retry_count: i32) -> chrono::Duration {
    let exponent = (retry_count - 1).clamp(0, 6) as u32;
    chrono::Duration::minutes(5 * 2_i64.pow(exponent))
}

/// SHA-256 hex digest of the lowercased recipient; the only recipient form
/// that ever reaches the delivery log.
pub fn hash_recipient(recipient: &str) -> String {
    hex::encode(Sha256::digest(recipient.trim().to_lowercase().as_bytes()))
}

pub fn validate_payload(payload: &EmailPayload) -> Result<EmailTemplate, String> {
    let template = EmailTemplate::parse(&payload.template)
        .ok_or_else(|| format!("unknown email template: {}", payload.template))?;
    if payload.recipient.is_empty() {
        return Err("empty recipient".to_string());
    }
    Ok(template)
}

/// Insert a pending outbox row inside the caller's transaction. The email is
/// only ever sent if the enclosing business transaction commits.
pub async fn enqueue(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: Uuid,
    payload: &EmailPayload,
) -> AppResult<Uuid> {
    validate_payload(payload).map_err(AppError::Validation)?;

    let id: Uuid = sqlx::query_scalar(
        "INSERT INTO email_outbox (tenant_id, payload, status, next_retry_at)
         VALUES ($1, $2, 'pending', NOW())
         RETURNING id",
    )
    .bind(tenant_id)
    .bind(serde_json::to_value(payload).map_err(|e| AppError::Internal(e.into()))?)
    .fetch_one(&mut **tx)
    .await?;

    Ok(id)
}

// ─── Worker ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 25,
        }
    }
}

/// Worker loop: claim a batch, deliver each item outside the claim
/// transaction, record the outcome in a fresh transaction. Failures only
/// ever mutate outbox rows.
pub async fn run(pool: PgPool, config: Config, worker: WorkerConfig) {
    tracing::info!(
        "outbox worker started (batch {}, every {:?})",
        worker.batch_size,
        worker.poll_interval
    );
    let mut ticker = tokio::time::interval(worker.poll_interval);
    loop {
        ticker.tick().await;
        let batch = match claim_batch(&pool, worker.batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!("outbox claim failed: {e}");
                continue;
            }
        };
        if batch.is_empty() {
            continue;
        }
        tracing::info!("claimed {} outbox item(s)", batch.len());
        for item in batch {
            process_item(&pool, &config, item).await;
        }
    }
}

/// Claim up to `limit` due rows: flip them to `processing` in one statement.
/// `FOR UPDATE SKIP LOCKED` guarantees no two workers advance the same row.
pub async fn claim_batch(pool: &PgPool, limit: i64) -> Result<Vec<OutboxItem>, sqlx::Error> {
    let mut tx = db::tenant::begin_system_tx(pool).await?;
    let items = sqlx::query_as::<_, OutboxItem>(
        "UPDATE email_outbox
         SET status = 'processing', processing_started_at = NOW()
         WHERE id IN (
             SELECT id FROM email_outbox
             WHERE status = 'pending' AND next_retry_at <= NOW()
             ORDER BY created_at
             LIMIT $1
             FOR UPDATE SKIP LOCKED
         )
         RETURNING *",
    )
    .bind(limit)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(items)
}

async fn process_item(pool: &PgPool, config: &Config, item: OutboxItem) {
    match attempt_delivery(pool, config, &item).await {
        Ok(message_id) => {
            metrics::OUTBOX_COUNTER.with_label_values(&["sent"]).inc();
            if let Err(e) = mark_sent(pool, &item, &message_id).await {
                tracing::error!("failed to mark outbox item {} sent: {e}", item.id);
            }
        }
        Err(reason) => {
            metrics::OUTBOX_COUNTER.with_label_values(&["failed"]).inc();
            tracing::warn!("delivery of outbox item {} failed: {reason}", item.id);
            if let Err(e) = record_failure(pool, &item, &reason).await {
                tracing::error!("failed to record outbox failure for {}: {e}", item.id);
            }
        }
    }
}

/// One delivery attempt. Every failure is reported as a string so only
/// outbox columns are mutated; nothing propagates.
async fn attempt_delivery(pool: &PgPool, config: &Config, item: &OutboxItem) -> Result<String, String> {
    let payload: EmailPayload = serde_json::from_value(item.payload.clone())
        .map_err(|e| format!("malformed payload: {e}"))?;
    let template =
        validate_payload(&payload).map_err(|e| format!("payload validation failed: {e}"))?;

    let tenant = sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE id = $1")
        .bind(item.tenant_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| format!("tenant lookup failed: {e}"))?
        .ok_or_else(|| "tenant no longer exists".to_string())?;

    let smtp = email::resolve_smtp_config(&tenant, config)
        .map_err(|e| format!("mail configuration error: {e}"))?
        .ok_or_else(|| "no SMTP configuration for tenant".to_string())?;

    // Egress validation runs before every attempt, not only at config time.
    email::validate_smtp_host(&smtp.host, smtp.port).await?;

    let (subject, text, html) = email::render(template, &payload.data);
    email::send_mail(&smtp, &payload.recipient, &subject, &text, &html)
        .await
        .map_err(|e| format!("smtp delivery failed: {e}"))
}

/// Success: flip to `sent` and write the pseudonymised delivery-log row, in
/// one fresh transaction.
async fn mark_sent(pool: &PgPool, item: &OutboxItem, message_id: &str) -> Result<(), sqlx::Error> {
    let payload: EmailPayload = serde_json::from_value(item.payload.clone()).unwrap_or(EmailPayload {
        recipient: String::new(),
        template: String::new(),
        data: serde_json::Value::Null,
        correlator: String::new(),
    });

    let mut tx = db::tenant::begin_system_tx(pool).await?;

    let log_id: Uuid = sqlx::query_scalar(
        "INSERT INTO email_log (tenant_id, recipient_hash, template, status, provider_msg_id)
         VALUES ($1, $2, $3, 'sent', $4)
         RETURNING id",
    )
    .bind(item.tenant_id)
    .bind(hash_recipient(&payload.recipient))
    .bind(&payload.template)
    .bind(message_id)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE email_outbox
         SET status = 'sent', processed_at = NOW(), email_log_id = $2, last_error = NULL
         WHERE id = $1",
    )
    .bind(item.id)
    .bind(log_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

/// Failure: schedule a retry with exponential backoff, or give up once the
/// retry budget is exhausted.
async fn record_failure(pool: &PgPool, item: &OutboxItem, error: &str) -> Result<(), sqlx::Error> {
    let retries = item.retry_count + 1;
    if retries >= item.max_retries {
        sqlx::query(
            "UPDATE email_outbox
             SET status = 'failed', retry_count = $2, last_error = $3, processed_at = NOW()
             WHERE id = $1",
        )
        .bind(item.id)
        .bind(retries)
        .bind(error)
        .execute(pool)
        .await?;
    } else {
        let next = Utc::now() + backoff(retries);
        sqlx::query(
            "UPDATE email_outbox
             SET status = 'pending', retry_count = $2, last_error = $3, next_retry_at = $4
             WHERE id = $1",
        )
        .bind(item.id)
        .bind(retries)
        .bind(error)
        .bind(next)
        .execute(pool)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_doubles_from_five_minutes() {
        assert_eq!(backoff(1), chrono::Duration::minutes(5));
        assert_eq!(backoff(2), chrono::Duration::minutes(10));
        assert_eq!(backoff(3), chrono::Duration::minutes(20));
        // Degenerate input still yields the baseline.
        assert_eq!(backoff(0), chrono::Duration::minutes(5));
    }

    #[test]
    fn recipient_digest_is_not_an_email_address() {
        let digest = hash_recipient("Ada.Lovelace@Example.com");
        assert_eq!(digest.len(), 64);
        assert!(!digest.contains('@'));
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        // Case-insensitive: the same mailbox hashes identically.
        assert_eq!(digest, hash_recipient("ada.lovelace@example.com"));
    }

    #[test]
    fn payload_template_must_be_whitelisted() {
        let mut payload = EmailPayload {
            recipient: "u@example.com".into(),
            template: "password_reset".into(),
            data: json!({}),
            correlator: "req-1".into(),
        };
        assert!(validate_payload(&payload).is_ok());

        payload.template = "../templates/secret".into();
        assert!(validate_payload(&payload).is_err());

        payload.template = "password_reset".into();
        payload.recipient = String::new();
        assert!(validate_payload(&payload).is_err());
    }
}
