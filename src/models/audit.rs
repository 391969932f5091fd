use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// An audit event to record. Collected during the request and written after
/// the business transaction commits, through the without-tenant path.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub action: String,
    pub tenant_id: Option<Uuid>,
    pub actor_id: Option<Uuid>,
    pub target_id: Option<String>,
    pub session_id: Option<Uuid>,
    pub metadata: Value,
    pub ip_address: String,
    pub user_agent: String,
    pub request_id: String,
}

impl AuditEvent {
    pub fn new(action: &str) -> Self {
        Self {
            action: action.to_string(),
            tenant_id: None,
            actor_id: None,
            target_id: None,
            session_id: None,
            metadata: Value::Object(Default::default()),
            ip_address: String::new(),
            user_agent: String::new(),
            request_id: String::new(),
        }
    }

    pub fn tenant(mut self, id: Uuid) -> Self {
        self.tenant_id = Some(id);
        self
    }

    pub fn actor(mut self, id: Uuid) -> Self {
        self.actor_id = Some(id);
        self
    }

    pub fn target(mut self, id: impl ToString) -> Self {
        self.target_id = Some(id.to_string());
        self
    }

    pub fn session(mut self, id: Uuid) -> Self {
        self.session_id = Some(id);
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        if let Value::Object(map) = &mut self.metadata {
            map.insert(key.to_string(), value.into());
        }
        self
    }
}

/// Row shape for the admin audit-log listing.
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct AuditLogRow {
    pub id: Uuid,
    pub action: String,
    pub actor_id: Option<Uuid>,
    pub target_id: Option<String>,
    pub session_id: Option<Uuid>,
    pub metadata: Value,
    pub ip_address: String,
    pub user_agent: String,
    pub request_id: String,
    pub created_at: DateTime<Utc>,
}
