use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Tenant {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub allowed_origins: Value,
    pub allowed_redirects: Value,
    pub branding: Value,
    pub settings: Value,
    pub shared_secret_hash: Option<String>,
    pub app_base_url: String,
    pub smtp_host: Option<String>,
    pub smtp_port: Option<i32>,
    pub smtp_username: Option<String>,
    pub smtp_password_enc: Option<Vec<u8>>,
    pub smtp_password_nonce: Option<Vec<u8>>,
    pub smtp_key_version: Option<String>,
    pub smtp_from: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn allows_public_registration(&self) -> bool {
        self.settings
            .get("public_registration")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn allowed_origins(&self) -> Vec<String> {
        self.allowed_origins
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True if the tenant has its own outbound-mail configuration.
    pub fn has_mail_config(&self) -> bool {
        self.smtp_host.is_some() && self.smtp_password_enc.is_some()
    }
}

/// The unauthenticated tenant view served from `GET /tenants/{slug}`.
#[derive(Debug, Serialize)]
pub struct PublicTenant {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub branding: Value,
    pub public_registration: bool,
}

impl From<&Tenant> for PublicTenant {
    fn from(t: &Tenant) -> Self {
        Self {
            id: t.id,
            slug: t.slug.clone(),
            name: t.name.clone(),
            branding: t.branding.clone(),
            public_registration: t.allows_public_registration(),
        }
    }
}

/// Validates a single allowed-origin value at configuration time.
/// Wildcards are rejected outright; only https origins (or plain-http
/// localhost for development) are acceptable.
pub fn validate_allowed_origin(origin: &str) -> Result<(), String> {
    if origin.contains('*') {
        return Err(format!("wildcard origins are not allowed: {origin}"));
    }
    if origin.starts_with("https://") && origin.len() > "https://".len() {
        return Ok(());
    }
    if origin.starts_with("http://localhost") || origin.starts_with("http://127.0.0.1") {
        return Ok(());
    }
    Err(format!("origin must be https:// or http://localhost: {origin}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_origins_rejected() {
        assert!(validate_allowed_origin("*").is_err());
        assert!(validate_allowed_origin("https://*.example.com").is_err());
    }

    #[test]
    fn only_https_or_localhost_accepted() {
        assert!(validate_allowed_origin("https://app.example.com").is_ok());
        assert!(validate_allowed_origin("http://localhost:3000").is_ok());
        assert!(validate_allowed_origin("http://127.0.0.1:5173").is_ok());
        assert!(validate_allowed_origin("http://app.example.com").is_err());
        assert!(validate_allowed_origin("ftp://example.com").is_err());
        assert!(validate_allowed_origin("https://").is_err());
    }
}
