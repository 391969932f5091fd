use chrono::{Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::outbox::EmailPayload;
use crate::models::session::{RefreshToken, SessionView};
use crate::models::tenant::Tenant;
use crate::models::token::{BackupCode, Invitation, TokenPurpose, VerificationToken};
use crate::models::user::{
    validate_email, validate_password, RegisterRequest, User, UserRole,
};
use crate::services::metrics;
use crate::services::outbox;
use crate::services::tokens::TokenService;
use crate::services::twofactor::TwoFactorService;

/// Concurrent rotations of the same refresh token within this window are
/// treated as a client race, not reuse. Tuned to one short network
/// round-trip; deliberately not a tenant-facing knob.
pub const REFRESH_GRACE_WINDOW_SECS: i64 = 10;

const MAX_FAILED_LOGINS: i32 = 5;
const LOCKOUT_MINUTES: i64 = 15;

const RESET_TOKEN_TTL_MINUTES: i64 = 15;
const VERIFY_TOKEN_TTL_HOURS: i64 = 24;
const EMAIL_CHANGE_TTL_HOURS: i64 = 24;
const INVITATION_TTL_DAYS: i64 = 7;

/// Result of the password step of login.
pub enum LoginOutcome {
    /// Second factor enabled: one pre-auth attempt is authorised.
    MfaRequired { pre_auth_token: String },
    Authenticated(IssuedSession),
}

/// A freshly minted token pair plus the principal it belongs to.
pub struct IssuedSession {
    pub user: User,
    pub role: UserRole,
    pub access_token: String,
    pub refresh_token: String,
    pub session_id: Uuid,
    pub family_id: Uuid,
}

/// Generate an opaque refresh/verification token and the digest under which
/// it is stored. The raw value never touches the database.
pub fn generate_opaque_token() -> (String, String) {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let raw = hex::encode(bytes);
    let digest = hash_opaque_token(&raw);
    (raw, digest)
}

pub fn hash_opaque_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

pub struct AuthService;

impl AuthService {
    // ─── Login ──────────────────────────────────────────────────────────────

    /// Password step of the login state machine. Every failure cause
    /// collapses into the uniform `InvalidCredentials`.
    pub async fn login(
        tx: &mut Transaction<'_, Postgres>,
        pool: &PgPool,
        tokens: &TokenService,
        config: &Config,
        tenant: &Tenant,
        email: &str,
        password: &str,
        ip: &str,
        user_agent: &str,
    ) -> AppResult<LoginOutcome> {
        let email = email.trim().to_lowercase();

        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE email = $1 AND is_active = TRUE",
        )
        .bind(&email)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(AppError::InvalidCredentials)?;

        if user.is_locked() {
            metrics::LOGINS_COUNTER
                .with_label_values(&[tenant.slug.as_str(), "locked"])
                .inc();
            return Err(AppError::InvalidCredentials);
        }

        let Some(hash) = user.password_hash.as_deref() else {
            return Err(AppError::InvalidCredentials);
        };

        if !bcrypt::verify(password, hash).unwrap_or(false) {
            // The login response will be a 401 and the request transaction
            // rolls back, so the counter is bumped on its own connection.
            Self::record_failed_login(pool, tenant.id, user.id).await;
            metrics::LOGINS_COUNTER
                .with_label_values(&[tenant.slug.as_str(), "failure"])
                .inc();
            return Err(AppError::InvalidCredentials);
        }

        // Unverified principals fail with the same shape as a bad password.
        if !user.email_verified {
            metrics::LOGINS_COUNTER
                .with_label_values(&[tenant.slug.as_str(), "unverified"])
                .inc();
            return Err(AppError::InvalidCredentials);
        }

        if user.failed_login_attempts > 0 {
            sqlx::query(
                "UPDATE users SET failed_login_attempts = 0, locked_until = NULL WHERE id = $1",
            )
            .bind(user.id)
            .execute(&mut **tx)
            .await?;
        }

        // A principal without a membership cannot hold a session.
        let role = Self::role_of(tx, user.id).await?.ok_or(AppError::InvalidCredentials)?;

        if user.totp_enabled && user.totp_secret.is_some() {
            let pre_auth_token = tokens.issue_pre_auth(user.id)?;
            return Ok(LoginOutcome::MfaRequired { pre_auth_token });
        }

        metrics::LOGINS_COUNTER
            .with_label_values(&[tenant.slug.as_str(), "success"])
            .inc();
        let session = Self::issue_session(tx, tokens, config, user, role, ip, user_agent).await?;
        Ok(LoginOutcome::Authenticated(session))
    }

    /// Second-factor step: time-based code.
    pub async fn complete_totp(
        tx: &mut Transaction<'_, Postgres>,
        tokens: &TokenService,
        config: &Config,
        user_id: Uuid,
        code: &str,
        ip: &str,
        user_agent: &str,
    ) -> AppResult<IssuedSession> {
        let user = Self::require_user(tx, user_id).await?;
        let Some(secret) = user.totp_secret.as_deref().filter(|_| user.totp_enabled) else {
            return Err(AppError::InvalidCredentials);
        };
        if !TwoFactorService::verify_code(secret, code) {
            return Err(AppError::InvalidCode);
        }
        let role = Self::role_of(tx, user.id).await?.ok_or(AppError::InvalidCredentials)?;
        Self::issue_session(tx, tokens, config, user, role, ip, user_agent).await
    }

    /// Second-factor step: single-use recovery code. A consumed code is
    /// disabled forever.
    pub async fn complete_backup_code(
        tx: &mut Transaction<'_, Postgres>,
        tokens: &TokenService,
        config: &Config,
        user_id: Uuid,
        code: &str,
        ip: &str,
        user_agent: &str,
    ) -> AppResult<IssuedSession> {
        let user = Self::require_user(tx, user_id).await?;

        let candidates = sqlx::query_as::<_, BackupCode>(
            "SELECT * FROM backup_codes WHERE user_id = $1 AND used = FALSE",
        )
        .bind(user.id)
        .fetch_all(&mut **tx)
        .await?;

        let matched = candidates
            .iter()
            .find(|c| TwoFactorService::verify_backup_code(code, &c.code_hash))
            .map(|c| c.id)
            .ok_or(AppError::InvalidCode)?;

        sqlx::query("UPDATE backup_codes SET used = TRUE WHERE id = $1")
            .bind(matched)
            .execute(&mut **tx)
            .await?;

        let role = Self::role_of(tx, user.id).await?.ok_or(AppError::InvalidCredentials)?;
        Self::issue_session(tx, tokens, config, user, role, ip, user_agent).await
    }

    /// Create a new refresh family rooted at this login and issue the token
    /// pair.
    pub async fn issue_session(
        tx: &mut Transaction<'_, Postgres>,
        tokens: &TokenService,
        config: &Config,
        user: User,
        role: UserRole,
        ip: &str,
        user_agent: &str,
    ) -> AppResult<IssuedSession> {
        let (raw, digest) = generate_opaque_token();
        let session_id = Uuid::new_v4();
        let family_id = Uuid::new_v4();
        let expires_at = Utc::now() + Duration::days(config.refresh_token_ttl_days);

        sqlx::query(
            "INSERT INTO refresh_tokens
                (id, user_id, tenant_id, token_hash, parent_id, family_id,
                 ip_address, user_agent, expires_at)
             VALUES ($1, $2, $3, $4, NULL, $5, $6, $7, $8)",
        )
        .bind(session_id)
        .bind(user.id)
        .bind(user.tenant_id)
        .bind(&digest)
        .bind(family_id)
        .bind(ip)
        .bind(user_agent)
        .bind(expires_at)
        .execute(&mut **tx)
        .await?;

        let access_token = tokens.issue_access(user.id, user.tenant_id, role)?;
        Ok(IssuedSession {
            user,
            role,
            access_token,
            refresh_token: raw,
            session_id,
            family_id,
        })
    }

    // ─── Refresh rotation ───────────────────────────────────────────────────

    /// Rotate a refresh token. The revoke-old + insert-new pair is a single
    /// atomic statement; of two concurrent rotations of the same record
    /// exactly one wins and the other observes the row already revoked.
    pub async fn refresh(
        tx: &mut Transaction<'_, Postgres>,
        pool: &PgPool,
        tokens: &TokenService,
        config: &Config,
        raw_token: &str,
        ip: &str,
        user_agent: &str,
    ) -> AppResult<IssuedSession> {
        let digest = hash_opaque_token(raw_token);

        let presented = sqlx::query_as::<_, RefreshToken>(
            "SELECT * FROM refresh_tokens WHERE token_hash = $1",
        )
        .bind(&digest)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(AppError::InvalidCredentials)?;

        if presented.revoked {
            return Err(Self::handle_revoked_presentation(pool, &presented).await?);
        }
        if presented.is_expired() {
            metrics::REFRESH_COUNTER.with_label_values(&["expired"]).inc();
            return Err(AppError::InvalidCredentials);
        }

        let (new_raw, new_digest) = generate_opaque_token();
        let new_id = Uuid::new_v4();
        let expires_at = Utc::now() + Duration::days(config.refresh_token_ttl_days);

        // Revoke the presented record and insert its successor in one
        // statement. A concurrent duplicate blocks on the row lock, then
        // sees revoked = TRUE and matches zero rows.
        let rotated: Option<Uuid> = sqlx::query_scalar(
            "WITH revoked AS (
                 UPDATE refresh_tokens
                 SET revoked = TRUE, revoked_at = NOW()
                 WHERE id = $1 AND revoked = FALSE
                 RETURNING id, user_id, tenant_id, family_id
             )
             INSERT INTO refresh_tokens
                 (id, user_id, tenant_id, token_hash, parent_id, family_id,
                  ip_address, user_agent, expires_at)
             SELECT $2, user_id, tenant_id, $3, id, family_id, $4, $5, $6
             FROM revoked
             RETURNING id",
        )
        .bind(presented.id)
        .bind(new_id)
        .bind(&new_digest)
        .bind(ip)
        .bind(user_agent)
        .bind(expires_at)
        .fetch_optional(&mut **tx)
        .await?;

        if rotated.is_none() {
            // Lost the race: re-read and classify as grace or reuse.
            let fresh = sqlx::query_as::<_, RefreshToken>(
                "SELECT * FROM refresh_tokens WHERE id = $1",
            )
            .bind(presented.id)
            .fetch_one(&mut **tx)
            .await?;
            return Err(Self::handle_revoked_presentation(pool, &fresh).await?);
        }

        let user = Self::require_user(tx, presented.user_id).await?;
        let role = Self::role_of(tx, user.id).await?.ok_or(AppError::InvalidCredentials)?;
        let access_token = tokens.issue_access(user.id, user.tenant_id, role)?;

        metrics::REFRESH_COUNTER.with_label_values(&["rotated"]).inc();
        Ok(IssuedSession {
            user,
            role,
            access_token,
            refresh_token: new_raw,
            session_id: new_id,
            family_id: presented.family_id,
        })
    }

    /// A refresh token was presented while already revoked. Inside the grace
    /// window this is the two-tabs race; outside it, it is reuse and the
    /// whole family is poisoned.
    ///
    /// The error response will be a 401 and roll the request transaction
    /// back, so the family revocation runs on its own tenant-bound
    /// transaction and commits immediately.
    async fn handle_revoked_presentation(
        pool: &PgPool,
        presented: &RefreshToken,
    ) -> Result<AppError, AppError> {
        if let Some(revoked_at) = presented.revoked_at {
            if (Utc::now() - revoked_at).num_seconds() < REFRESH_GRACE_WINDOW_SECS {
                metrics::REFRESH_COUNTER.with_label_values(&["concurrent"]).inc();
                return Ok(AppError::ConcurrentRefresh);
            }
        }

        metrics::REUSE_DETECTED.inc();
        metrics::REFRESH_COUNTER.with_label_values(&["reuse"]).inc();
        tracing::warn!(
            family = %presented.family_id,
            user = %presented.user_id,
            "refresh token reuse detected; revoking family"
        );

        let mut alert_tx = crate::db::tenant::begin_tenant_tx(pool, presented.tenant_id).await?;
        sqlx::query(
            "UPDATE refresh_tokens
             SET revoked = TRUE, revoked_at = NOW()
             WHERE family_id = $1 AND revoked = FALSE",
        )
        .bind(presented.family_id)
        .execute(&mut *alert_tx)
        .await?;

        // Tell the account owner their sessions were torn down.
        let owner: Option<(String, String)> =
            sqlx::query_as("SELECT email, full_name FROM users WHERE id = $1")
                .bind(presented.user_id)
                .fetch_optional(&mut *alert_tx)
                .await?;
        let tenant_name: Option<String> =
            sqlx::query_scalar("SELECT name FROM tenants WHERE id = $1")
                .bind(presented.tenant_id)
                .fetch_optional(&mut *alert_tx)
                .await?;
        if let Some((email, name)) = owner {
            let payload = EmailPayload {
                recipient: email,
                template: "security_alert".into(),
                data: serde_json::json!({
                    "tenant_name": tenant_name.unwrap_or_default(),
                    "name": name,
                }),
                correlator: String::new(),
            };
            outbox::enqueue(&mut alert_tx, presented.tenant_id, &payload).await?;
        }
        alert_tx.commit().await?;

        crate::services::audit::record_detached(
            pool.clone(),
            crate::models::audit::AuditEvent::new("token.reuse_detected")
                .tenant(presented.tenant_id)
                .actor(presented.user_id)
                .session(presented.id)
                .meta("family_id", presented.family_id.to_string()),
        );

        Ok(AppError::SecurityAlert)
    }

    // ─── Revocation ─────────────────────────────────────────────────────────

    /// Family revocation by presented token. Idempotent: an unknown or
    /// already-revoked token is a no-op success.
    pub async fn logout(
        tx: &mut Transaction<'_, Postgres>,
        raw_token: &str,
    ) -> AppResult<Option<RefreshToken>> {
        let digest = hash_opaque_token(raw_token);
        let found = sqlx::query_as::<_, RefreshToken>(
            "SELECT * FROM refresh_tokens WHERE token_hash = $1",
        )
        .bind(&digest)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(record) = &found {
            sqlx::query(
                "UPDATE refresh_tokens
                 SET revoked = TRUE, revoked_at = NOW()
                 WHERE family_id = $1 AND revoked = FALSE",
            )
            .bind(record.family_id)
            .execute(&mut **tx)
            .await?;
        }
        Ok(found)
    }

    pub async fn list_sessions(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
    ) -> AppResult<Vec<SessionView>> {
        let sessions = sqlx::query_as::<_, SessionView>(
            "SELECT id, family_id, ip_address, user_agent, created_at, expires_at
             FROM refresh_tokens
             WHERE user_id = $1 AND revoked = FALSE AND expires_at > NOW()
             ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&mut **tx)
        .await?;
        Ok(sessions)
    }

    /// Revoke one session (its whole family), scoped by owner.
    pub async fn revoke_session(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        session_id: Uuid,
    ) -> AppResult<bool> {
        let affected = sqlx::query(
            "UPDATE refresh_tokens
             SET revoked = TRUE, revoked_at = NOW()
             WHERE revoked = FALSE AND family_id = (
                 SELECT family_id FROM refresh_tokens WHERE id = $1 AND user_id = $2
             )",
        )
        .bind(session_id)
        .bind(user_id)
        .execute(&mut **tx)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// The nuclear option: revoke every session the principal owns.
    pub async fn revoke_all_sessions(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
    ) -> AppResult<u64> {
        let affected = sqlx::query(
            "UPDATE refresh_tokens
             SET revoked = TRUE, revoked_at = NOW()
             WHERE user_id = $1 AND revoked = FALSE",
        )
        .bind(user_id)
        .execute(&mut **tx)
        .await?
        .rows_affected();
        Ok(affected)
    }

    // ─── Registration ───────────────────────────────────────────────────────

    /// Public registration: principal and viewer membership are created in a
    /// single round-trip, so an orphan principal is not representable.
    pub async fn register_public(
        tx: &mut Transaction<'_, Postgres>,
        config: &Config,
        tenant: &Tenant,
        req: &RegisterRequest,
    ) -> AppResult<User> {
        if !tenant.allows_public_registration() {
            return Err(AppError::PublicRegistrationDisabled);
        }
        let email = req.email.trim().to_lowercase();
        validate_email(&email).map_err(AppError::Validation)?;
        validate_password(&req.password).map_err(AppError::Validation)?;

        let hash = bcrypt::hash(&req.password, config.bcrypt_cost)
            .map_err(|e| AppError::Internal(e.into()))?;

        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM register_public_user($1, $2, $3, $4)",
        )
        .bind(tenant.id)
        .bind(&email)
        .bind(&hash)
        .bind(req.full_name.trim())
        .fetch_one(&mut **tx)
        .await
        .map_err(map_unique_violation)?;

        Ok(user)
    }

    /// Invitation-based registration. The invite must carry the same email
    /// as the payload; principal, membership and invitation consumption are
    /// one round-trip.
    pub async fn register_invited(
        tx: &mut Transaction<'_, Postgres>,
        config: &Config,
        req: &RegisterRequest,
        raw_token: &str,
    ) -> AppResult<User> {
        let email = req.email.trim().to_lowercase();
        validate_email(&email).map_err(AppError::Validation)?;
        validate_password(&req.password).map_err(AppError::Validation)?;

        let digest = hash_opaque_token(raw_token);
        let invitation = sqlx::query_as::<_, Invitation>(
            "SELECT * FROM invitations WHERE token_hash = $1 AND accepted = FALSE",
        )
        .bind(&digest)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AppError::Validation("invalid or expired invitation".into()))?;

        if invitation.expires_at < Utc::now() {
            return Err(AppError::Validation("invalid or expired invitation".into()));
        }
        if invitation.email.to_lowercase() != email {
            return Err(AppError::Validation(
                "invitation was issued for a different email".into(),
            ));
        }

        let hash = bcrypt::hash(&req.password, config.bcrypt_cost)
            .map_err(|e| AppError::Internal(e.into()))?;

        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM register_invited_user($1, $2, $3, $4, $5, $6)",
        )
        .bind(invitation.tenant_id)
        .bind(invitation.id)
        .bind(&email)
        .bind(&hash)
        .bind(req.full_name.trim())
        .bind(invitation.role)
        .fetch_one(&mut **tx)
        .await
        .map_err(map_unique_violation)?;

        Ok(user)
    }

    // ─── Recovery flows ─────────────────────────────────────────────────────

    /// Always succeeds toward the client; internally creates the one-time
    /// token and enqueues the email only when the principal exists.
    pub async fn request_password_reset(
        tx: &mut Transaction<'_, Postgres>,
        tenant: &Tenant,
        email: &str,
        correlator: &str,
    ) -> AppResult<()> {
        let email = email.trim().to_lowercase();
        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE email = $1 AND is_active = TRUE",
        )
        .bind(&email)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(user) = user else { return Ok(()) };

        let (raw, digest) = generate_opaque_token();
        sqlx::query(
            "INSERT INTO verification_tokens
                 (user_id, tenant_id, token_hash, purpose, expires_at)
             VALUES ($1, $2, $3, 'password_reset', $4)",
        )
        .bind(user.id)
        .bind(tenant.id)
        .bind(&digest)
        .bind(Utc::now() + Duration::minutes(RESET_TOKEN_TTL_MINUTES))
        .execute(&mut **tx)
        .await?;

        let payload = EmailPayload {
            recipient: user.email.clone(),
            template: "password_reset".into(),
            data: serde_json::json!({
                "tenant_name": tenant.name,
                "name": user.full_name,
                "link": format!("{}/reset-password?token={raw}", tenant.app_base_url),
            }),
            correlator: correlator.to_string(),
        };
        outbox::enqueue(tx, tenant.id, &payload).await?;
        Ok(())
    }

    /// Consume a reset token: verify, update the password hash, revoke every
    /// session, delete the token.
    pub async fn reset_password(
        tx: &mut Transaction<'_, Postgres>,
        config: &Config,
        raw_token: &str,
        new_password: &str,
    ) -> AppResult<()> {
        validate_password(new_password).map_err(AppError::Validation)?;
        let token = Self::consume_verification_token(tx, raw_token, TokenPurpose::PasswordReset)
            .await?;

        let hash = bcrypt::hash(new_password, config.bcrypt_cost)
            .map_err(|e| AppError::Internal(e.into()))?;
        sqlx::query("UPDATE users SET password_hash = $1 WHERE id = $2")
            .bind(&hash)
            .bind(token.user_id)
            .execute(&mut **tx)
            .await?;

        Self::revoke_all_sessions(tx, token.user_id).await?;
        Ok(())
    }

    pub async fn request_email_verification(
        tx: &mut Transaction<'_, Postgres>,
        tenant: &Tenant,
        email: &str,
        correlator: &str,
    ) -> AppResult<()> {
        let email = email.trim().to_lowercase();
        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE email = $1 AND is_active = TRUE AND email_verified = FALSE",
        )
        .bind(&email)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(user) = user else { return Ok(()) };

        let (raw, digest) = generate_opaque_token();
        sqlx::query(
            "INSERT INTO verification_tokens
                 (user_id, tenant_id, token_hash, purpose, expires_at)
             VALUES ($1, $2, $3, 'email_verify', $4)",
        )
        .bind(user.id)
        .bind(tenant.id)
        .bind(&digest)
        .bind(Utc::now() + Duration::hours(VERIFY_TOKEN_TTL_HOURS))
        .execute(&mut **tx)
        .await?;

        let payload = EmailPayload {
            recipient: user.email.clone(),
            template: "email_verify".into(),
            data: serde_json::json!({
                "tenant_name": tenant.name,
                "name": user.full_name,
                "link": format!("{}/verify-email?token={raw}", tenant.app_base_url),
            }),
            correlator: correlator.to_string(),
        };
        outbox::enqueue(tx, tenant.id, &payload).await?;
        Ok(())
    }

    pub async fn verify_email(
        tx: &mut Transaction<'_, Postgres>,
        raw_token: &str,
    ) -> AppResult<Uuid> {
        let token =
            Self::consume_verification_token(tx, raw_token, TokenPurpose::EmailVerify).await?;
        sqlx::query("UPDATE users SET email_verified = TRUE WHERE id = $1")
            .bind(token.user_id)
            .execute(&mut **tx)
            .await?;
        Ok(token.user_id)
    }

    /// Start an email change: password re-check, uniqueness probe, one-time
    /// token mailed to the new address.
    pub async fn request_email_change(
        tx: &mut Transaction<'_, Postgres>,
        tenant: &Tenant,
        user_id: Uuid,
        new_email: &str,
        password: &str,
        correlator: &str,
    ) -> AppResult<()> {
        let new_email = new_email.trim().to_lowercase();
        validate_email(&new_email).map_err(AppError::Validation)?;

        let user = Self::require_user(tx, user_id).await?;
        let Some(hash) = user.password_hash.as_deref() else {
            return Err(AppError::InvalidCredentials);
        };
        if !bcrypt::verify(password, hash).unwrap_or(false) {
            return Err(AppError::InvalidCredentials);
        }

        let taken: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM users WHERE email = $1 AND id <> $2)",
        )
        .bind(&new_email)
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await?;
        if taken {
            return Err(AppError::Conflict("email already in use".into()));
        }

        let (raw, digest) = generate_opaque_token();
        sqlx::query(
            "INSERT INTO verification_tokens
                 (user_id, tenant_id, token_hash, purpose, new_email, expires_at)
             VALUES ($1, $2, $3, 'email_change', $4, $5)",
        )
        .bind(user_id)
        .bind(tenant.id)
        .bind(&digest)
        .bind(&new_email)
        .bind(Utc::now() + Duration::hours(EMAIL_CHANGE_TTL_HOURS))
        .execute(&mut **tx)
        .await?;

        let payload = EmailPayload {
            recipient: new_email,
            template: "email_change_confirm".into(),
            data: serde_json::json!({
                "tenant_name": tenant.name,
                "name": user.full_name,
                "link": format!("{}/confirm-email?token={raw}", tenant.app_base_url),
            }),
            correlator: correlator.to_string(),
        };
        outbox::enqueue(tx, tenant.id, &payload).await?;
        Ok(())
    }

    pub async fn confirm_email_change(
        tx: &mut Transaction<'_, Postgres>,
        raw_token: &str,
    ) -> AppResult<Uuid> {
        let token =
            Self::consume_verification_token(tx, raw_token, TokenPurpose::EmailChange).await?;
        let new_email = token
            .new_email
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("email-change token without email")))?;

        sqlx::query("UPDATE users SET email = $1, email_verified = TRUE WHERE id = $2")
            .bind(&new_email)
            .bind(token.user_id)
            .execute(&mut **tx)
            .await
            .map_err(map_unique_violation)?;
        Ok(token.user_id)
    }

    // ─── Profile / password ─────────────────────────────────────────────────

    pub async fn change_password(
        tx: &mut Transaction<'_, Postgres>,
        config: &Config,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> AppResult<()> {
        validate_password(new_password).map_err(AppError::Validation)?;
        let user = Self::require_user(tx, user_id).await?;
        let Some(hash) = user.password_hash.as_deref() else {
            return Err(AppError::InvalidCredentials);
        };
        if !bcrypt::verify(current_password, hash).unwrap_or(false) {
            return Err(AppError::InvalidCredentials);
        }

        let new_hash = bcrypt::hash(new_password, config.bcrypt_cost)
            .map_err(|e| AppError::Internal(e.into()))?;
        sqlx::query("UPDATE users SET password_hash = $1 WHERE id = $2")
            .bind(&new_hash)
            .bind(user_id)
            .execute(&mut **tx)
            .await?;

        // Nuclear option: a password change invalidates every session.
        Self::revoke_all_sessions(tx, user_id).await?;
        Ok(())
    }

    pub async fn update_profile(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        full_name: &str,
    ) -> AppResult<User> {
        let user = sqlx::query_as::<_, User>(
            "UPDATE users SET full_name = $1 WHERE id = $2 RETURNING *",
        )
        .bind(full_name.trim())
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(AppError::NotFound)?;
        Ok(user)
    }

    // ─── Invitations ────────────────────────────────────────────────────────

    /// Create an invitation and enqueue the email. Returns the invitation id.
    pub async fn create_invitation(
        tx: &mut Transaction<'_, Postgres>,
        tenant: &Tenant,
        email: &str,
        role: UserRole,
        invited_by: Uuid,
        correlator: &str,
    ) -> AppResult<Uuid> {
        let email = email.trim().to_lowercase();
        validate_email(&email).map_err(AppError::Validation)?;

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE email = $1)")
                .bind(&email)
                .fetch_one(&mut **tx)
                .await?;
        if exists {
            return Err(AppError::Conflict("a user with this email already exists".into()));
        }

        let (raw, digest) = generate_opaque_token();
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO invitations (tenant_id, email, token_hash, role, invited_by, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id",
        )
        .bind(tenant.id)
        .bind(&email)
        .bind(&digest)
        .bind(role)
        .bind(invited_by)
        .bind(Utc::now() + Duration::days(INVITATION_TTL_DAYS))
        .fetch_one(&mut **tx)
        .await?;

        let payload = EmailPayload {
            recipient: email,
            template: "invitation".into(),
            data: serde_json::json!({
                "tenant_name": tenant.name,
                "role": role.to_string(),
                "link": format!("{}/register?token={raw}", tenant.app_base_url),
            }),
            correlator: correlator.to_string(),
        };
        outbox::enqueue(tx, tenant.id, &payload).await?;
        Ok(id)
    }

    // ─── Helpers ────────────────────────────────────────────────────────────

    pub async fn require_user(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
    ) -> AppResult<User> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1 AND is_active = TRUE")
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(AppError::InvalidCredentials)
    }

    /// Role through the membership of the principal's owning tenant; the
    /// row-level policy scopes the lookup to the bound tenant.
    pub async fn role_of(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
    ) -> AppResult<Option<UserRole>> {
        let role: Option<UserRole> =
            sqlx::query_scalar("SELECT role FROM memberships WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&mut **tx)
                .await?;
        Ok(role)
    }

    /// Bump the failed-login counter on its own connection: the surrounding
    /// request fails with a 401 and its transaction rolls back, but the
    /// counter must survive.
    async fn record_failed_login(pool: &PgPool, tenant_id: Uuid, user_id: Uuid) {
        let run = async {
            let mut tx = crate::db::tenant::begin_tenant_tx(pool, tenant_id).await?;
            sqlx::query(
                "UPDATE users
                 SET failed_login_attempts = failed_login_attempts + 1,
                     locked_until = CASE
                         WHEN failed_login_attempts + 1 >= $2
                         THEN NOW() + make_interval(mins => $3)
                         ELSE locked_until
                     END
                 WHERE id = $1",
            )
            .bind(user_id)
            .bind(MAX_FAILED_LOGINS)
            .bind(LOCKOUT_MINUTES as i32)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(())
        };
        if let Err(e) = run.await {
            tracing::warn!("failed to record failed login for {user_id}: {e}");
        }
    }

    async fn consume_verification_token(
        tx: &mut Transaction<'_, Postgres>,
        raw_token: &str,
        purpose: TokenPurpose,
    ) -> AppResult<VerificationToken> {
        let digest = hash_opaque_token(raw_token);
        let token = sqlx::query_as::<_, VerificationToken>(
            "DELETE FROM verification_tokens
             WHERE token_hash = $1 AND purpose = $2 AND used = FALSE
             RETURNING *",
        )
        .bind(&digest)
        .bind(purpose)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(AppError::InvalidCredentials)?;

        if token.is_expired() {
            return Err(AppError::InvalidCredentials);
        }
        Ok(token)
    }
}

/// Map a unique-constraint violation on (tenant_id, email) to a conflict the
/// client can act on.
fn map_unique_violation(err: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23505") {
            return AppError::Conflict("email already registered".into());
        }
    }
    AppError::Database(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_tokens_are_high_entropy_and_digest_stable() {
        let (raw, digest) = generate_opaque_token();
        assert_eq!(raw.len(), 64);
        assert_eq!(digest.len(), 64);
        assert_ne!(raw, digest);
        assert_eq!(digest, hash_opaque_token(&raw));

        let (other, _) = generate_opaque_token();
        assert_ne!(raw, other);
    }

    #[test]
    fn grace_window_matches_the_protocol() {
        assert_eq!(REFRESH_GRACE_WINDOW_SECS, 10);
    }
}
