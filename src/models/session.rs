use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// One link in a refresh-rotation chain. All records descending from a
/// single login share a `family_id`; the root has `parent_id = NULL`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub token_hash: String,
    pub parent_id: Option<Uuid>,
    pub family_id: Uuid,
    pub ip_address: String,
    pub user_agent: String,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RefreshToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }
}

/// Session as listed on `GET /auth/sessions`: one entry per live refresh
/// record, identified by its family so revocation kills the whole chain.
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct SessionView {
    pub id: Uuid,
    pub family_id: Uuid,
    pub ip_address: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
