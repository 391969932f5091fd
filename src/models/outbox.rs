use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "outbox_status", rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

/// A durable queue row representing one email to deliver.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxItem {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub payload: Value,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub email_log_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The opaque payload serialised into an outbox row at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailPayload {
    pub recipient: String,
    pub template: String,
    pub data: Value,
    /// Request correlator of the enqueuing request, for tracing.
    pub correlator: String,
}

