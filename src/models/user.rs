use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role within a tenant. Roles are ordered: a gate of role `r` admits any
/// principal whose weight is at least `r`'s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "member_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Editor,
    Viewer,
}

impl UserRole {
    pub fn weight(&self) -> u8 {
        match self {
            UserRole::Admin => 3,
            UserRole::Editor => 2,
            UserRole::Viewer => 1,
        }
    }

    pub fn at_least(&self, required: UserRole) -> bool {
        self.weight() >= required.weight()
    }
}

impl std::str::FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(UserRole::Admin),
            "editor" => Ok(UserRole::Editor),
            "viewer" => Ok(UserRole::Viewer),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UserRole::Admin => "admin",
            UserRole::Editor => "editor",
            UserRole::Viewer => "viewer",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub password_hash: Option<String>,
    pub full_name: String,
    pub email_verified: bool,
    pub totp_secret: Option<String>,
    pub totp_enabled: bool,
    pub failed_login_attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn is_locked(&self) -> bool {
        self.locked_until.map(|until| until > Utc::now()).unwrap_or(false)
    }
}

/// The user shape returned to clients.
#[derive(Debug, Serialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub full_name: String,
    pub email_verified: bool,
    pub totp_enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for UserProfile {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            email: u.email.clone(),
            full_name: u.full_name.clone(),
            email_verified: u.email_verified,
            totp_enabled: u.totp_enabled,
            created_at: u.created_at,
        }
    }
}

// ─── Request payloads ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub full_name: String,
    /// Raw invitation token; presence selects the invitation-based flow.
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct MfaCodeRequest {
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailRequest {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    pub full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeEmailRequest {
    pub new_email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct MfaActivateRequest {
    pub secret: String,
    pub code: String,
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct InviteUserRequest {
    pub email: String,
    pub role: UserRole,
}

#[derive(Debug, Deserialize)]
pub struct AdminUpdateUserRequest {
    pub role: Option<UserRole>,
    pub is_active: Option<bool>,
}

/// Minimum password length accepted anywhere a password is set.
pub const MIN_PASSWORD_LEN: usize = 12;

pub fn validate_password(password: &str) -> Result<(), String> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(format!("password must be at least {MIN_PASSWORD_LEN} characters"));
    }
    Ok(())
}

pub fn validate_email(email: &str) -> Result<(), String> {
    let ok = email.len() <= 255
        && email
            .split_once('@')
            .map(|(local, domain)| {
                !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
            })
            .unwrap_or(false)
        && !email.contains(char::is_whitespace);
    if ok {
        Ok(())
    } else {
        Err("invalid email address".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering() {
        assert!(UserRole::Admin.at_least(UserRole::Viewer));
        assert!(UserRole::Admin.at_least(UserRole::Admin));
        assert!(UserRole::Editor.at_least(UserRole::Viewer));
        assert!(!UserRole::Viewer.at_least(UserRole::Editor));
        assert!(!UserRole::Editor.at_least(UserRole::Admin));
    }

    #[test]
    fn password_minimum_length() {
        assert!(validate_password("short").is_err());
        assert!(validate_password("elevenchars").is_err());
        assert!(validate_password("twelve-chars").is_ok());
    }

    #[test]
    fn email_shapes() {
        assert!(validate_email("u@x.co").is_ok());
        assert!(validate_email("with.dots+tag@example.com").is_ok());
        assert!(validate_email("no-at-sign").is_err());
        assert!(validate_email("spaces in@x.co").is_err());
        assert!(validate_email("u@nodot").is_err());
        assert!(validate_email("u@.leading").is_err());
    }
}
