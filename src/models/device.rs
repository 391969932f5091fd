use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

/// A constrained device (sensor-class) authenticated by a per-device shared
/// secret. Lookup is always tenant-scoped.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Device {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub hardware_id: String,
    pub secret_hash: String,
    pub name: String,
    pub is_active: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct TelemetryRequest {
    pub hardware_id: String,
    pub secret: String,
    /// Free-form sensor readings, forwarded verbatim plus enrichment.
    pub payload: Value,
}
