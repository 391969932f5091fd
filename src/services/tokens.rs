use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::Config;
use crate::error::AppError;
use crate::models::auth::{AccessClaims, PreAuthClaims, SCOPE_ACCESS, SCOPE_PRE_AUTH};
use crate::models::user::UserRole;

/// Lifetime of a pre-auth claim: enough for one second-factor attempt.
const PRE_AUTH_TTL_SECS: i64 = 120;
/// Not-before is backdated to absorb clock skew between verifiers.
const NBF_SKEW_SECS: i64 = 60;

/// Issues and validates the two scopes of signed claims. Relying parties
/// verify against the published key set; the private key never leaves this
/// process. Immutable after construction.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    kid: String,
    issuer: String,
    access_ttl_secs: i64,
    jwks: Value,
}

impl TokenService {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let pem = match &config.jwt_private_key {
            Some(pem) => pem.clone(),
            None => {
                tracing::warn!("JWT_PRIVATE_KEY not set — generating an ephemeral development key");
                generate_dev_key()?
            }
        };

        let private = RsaPrivateKey::from_pkcs8_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
            .map_err(|e| anyhow::anyhow!("invalid JWT_PRIVATE_KEY: {e}"))?;
        let public = private.to_public_key();

        let n_bytes = public.n().to_bytes_be();
        let n = URL_SAFE_NO_PAD.encode(&n_bytes);
        let e = URL_SAFE_NO_PAD.encode(public.e().to_bytes_be());
        // Key identifier derived from the modulus, stable across restarts.
        let kid = hex::encode(&Sha256::digest(&n_bytes)[..8]);

        let public_pem = public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| anyhow::anyhow!("failed to encode public key: {e}"))?;

        let jwks = json!({
            "keys": [{
                "kty": "RSA",
                "use": "sig",
                "alg": "RS256",
                "kid": kid,
                "n": n,
                "e": e,
            }]
        });

        Ok(Self {
            encoding: EncodingKey::from_rsa_pem(pem.as_bytes())?,
            decoding: DecodingKey::from_rsa_pem(public_pem.as_bytes())?,
            kid,
            issuer: config.app_url.clone(),
            access_ttl_secs: config.access_token_ttl_secs,
            jwks,
        })
    }

    fn header(&self) -> Header {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        header
    }

    pub fn issue_access(
        &self,
        user_id: Uuid,
        tenant_id: Uuid,
        role: UserRole,
    ) -> anyhow::Result<String> {
        let now = Utc::now().timestamp();
        let claims = AccessClaims {
            sub: user_id.to_string(),
            tenant: tenant_id.to_string(),
            role,
            scope: SCOPE_ACCESS.to_string(),
            iss: self.issuer.clone(),
            aud: self.issuer.clone(),
            iat: now,
            nbf: now - NBF_SKEW_SECS,
            exp: now + self.access_ttl_secs,
        };
        Ok(encode(&self.header(), &claims, &self.encoding)?)
    }

    pub fn issue_pre_auth(&self, user_id: Uuid) -> anyhow::Result<String> {
        let now = Utc::now().timestamp();
        let claims = PreAuthClaims {
            sub: user_id.to_string(),
            scope: SCOPE_PRE_AUTH.to_string(),
            iss: self.issuer.clone(),
            iat: now,
            exp: now + PRE_AUTH_TTL_SECS,
        };
        Ok(encode(&self.header(), &claims, &self.encoding)?)
    }

    /// Validate an access token. Pinning the algorithm rejects anything not
    /// signed with the expected family; a pre-auth token presented here fails
    /// on its scope.
    pub fn verify_access(&self, token: &str) -> Result<AccessClaims, AppError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[self.issuer.as_str()]);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.validate_nbf = true;

        let data = decode::<AccessClaims>(token, &self.decoding, &validation)
            .map_err(|_| AppError::InvalidCredentials)?;
        if data.claims.scope != SCOPE_ACCESS {
            return Err(AppError::InvalidCredentials);
        }
        Ok(data.claims)
    }

    /// Validate a pre-auth token; an access token presented here fails on its
    /// scope.
    pub fn verify_pre_auth(&self, token: &str) -> Result<PreAuthClaims, AppError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[self.issuer.as_str()]);

        let data = decode::<PreAuthClaims>(token, &self.decoding, &validation)
            .map_err(|_| AppError::InvalidCredentials)?;
        if data.claims.scope != SCOPE_PRE_AUTH {
            return Err(AppError::InvalidCredentials);
        }
        Ok(data.claims)
    }

    /// The published verification key set.
    pub fn jwks(&self) -> Value {
        self.jwks.clone()
    }

    pub fn openid_configuration(&self) -> Value {
        json!({
            "issuer": self.issuer,
            "jwks_uri": format!("{}/.well-known/jwks.json", self.issuer),
            "response_types_supported": ["token"],
            "subject_types_supported": ["public"],
            "id_token_signing_alg_values_supported": ["RS256"],
        })
    }
}

fn generate_dev_key() -> anyhow::Result<String> {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048)?;
    Ok(key.to_pkcs8_pem(LineEnding::LF)?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use lazy_static::lazy_static;

    fn test_config() -> Config {
        Config {
            environment: Environment::Development,
            database_url: String::new(),
            host: String::new(),
            port: 0,
            app_url: "http://localhost:8080".into(),
            jwt_private_key: None,
            access_token_ttl_secs: 900,
            refresh_token_ttl_days: 7,
            bcrypt_cost: 4,
            tenant_secret_keys: Default::default(),
            tenant_secret_current: String::new(),
            sentry_dsn: None,
            trust_proxy_headers: false,
            rate_limit_per_second: 5.0,
            rate_limit_burst: 10.0,
            telemetry_url: None,
            telemetry_deploy_key: None,
            smtp_host: None,
            smtp_port: None,
            smtp_username: None,
            smtp_password: None,
            smtp_from: None,
        }
    }

    lazy_static! {
        // Key generation is expensive; share one service across tests.
        static ref SVC: TokenService = TokenService::new(&test_config()).unwrap();
    }

    #[test]
    fn access_token_round_trip() {
        let user = Uuid::new_v4();
        let tenant = Uuid::new_v4();
        let token = SVC.issue_access(user, tenant, UserRole::Editor).unwrap();
        let claims = SVC.verify_access(&token).unwrap();
        assert_eq!(claims.sub, user.to_string());
        assert_eq!(claims.tenant, tenant.to_string());
        assert_eq!(claims.role, UserRole::Editor);
        assert!(claims.nbf < claims.iat);
        assert_eq!(claims.exp - claims.iat, 900);
    }

    #[test]
    fn scope_confusion_is_rejected_both_ways() {
        let user = Uuid::new_v4();
        let pre = SVC.issue_pre_auth(user).unwrap();
        assert!(matches!(SVC.verify_access(&pre), Err(AppError::InvalidCredentials)));

        let access = SVC.issue_access(user, Uuid::new_v4(), UserRole::Viewer).unwrap();
        assert!(matches!(SVC.verify_pre_auth(&access), Err(AppError::InvalidCredentials)));
    }

    #[test]
    fn foreign_algorithm_is_rejected() {
        // A token signed with a symmetric key must never validate, even if
        // its payload looks plausible.
        let claims = PreAuthClaims {
            sub: Uuid::new_v4().to_string(),
            scope: SCOPE_PRE_AUTH.to_string(),
            iss: "http://localhost:8080".into(),
            iat: Utc::now().timestamp(),
            exp: Utc::now().timestamp() + 60,
        };
        let forged = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"guessable"),
        )
        .unwrap();
        assert!(SVC.verify_pre_auth(&forged).is_err());
    }

    #[test]
    fn garbage_tokens_are_invalid_credentials() {
        assert!(matches!(
            SVC.verify_access("not-a-token"),
            Err(AppError::InvalidCredentials)
        ));
    }

    #[test]
    fn jwks_exposes_key_components() {
        let jwks = SVC.jwks();
        let key = &jwks["keys"][0];
        assert_eq!(key["kty"], "RSA");
        assert_eq!(key["alg"], "RS256");
        assert!(key["kid"].as_str().unwrap().len() == 16);
        assert!(!key["n"].as_str().unwrap().is_empty());
        assert!(!key["e"].as_str().unwrap().is_empty());
    }

    #[test]
    fn discovery_document_points_at_jwks() {
        let doc = SVC.openid_configuration();
        assert_eq!(doc["issuer"], "http://localhost:8080");
        assert_eq!(
            doc["jwks_uri"],
            "http://localhost:8080/.well-known/jwks.json"
        );
    }
}
