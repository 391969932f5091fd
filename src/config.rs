use std::collections::HashMap;
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    pub database_url: String,
    pub host: String,
    pub port: u16,
    /// Public base URL of the service; doubles as the token issuer.
    pub app_url: String,
    /// PEM-encoded RSA private key. Absent in development an ephemeral key
    /// is generated; absent in production startup fails.
    pub jwt_private_key: Option<String>,
    pub access_token_ttl_secs: i64,
    pub refresh_token_ttl_days: i64,
    pub bcrypt_cost: u32,
    /// Versioned 32-byte keys for tenant mail-credential encryption.
    /// "v1" comes from TENANT_SECRET_KEY, "v2"/"v3" from the suffixed vars.
    pub tenant_secret_keys: HashMap<String, [u8; 32]>,
    pub tenant_secret_current: String,
    pub sentry_dsn: Option<String>,
    /// Trust X-Forwarded-For / X-Real-IP from the reverse proxy.
    pub trust_proxy_headers: bool,
    pub rate_limit_per_second: f64,
    pub rate_limit_burst: f64,
    pub telemetry_url: Option<String>,
    pub telemetry_deploy_key: Option<String>,
    // Process-wide SMTP fallback for tenants without their own mail config.
    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_from: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let environment = match env::var("APP_ENV").as_deref() {
            Ok("production") => Environment::Production,
            _ => Environment::Development,
        };

        let jwt_private_key = env::var("JWT_PRIVATE_KEY").ok().filter(|s| !s.is_empty());
        if environment == Environment::Production && jwt_private_key.is_none() {
            anyhow::bail!("JWT_PRIVATE_KEY is required in production");
        }

        let mut tenant_secret_keys = HashMap::new();
        let mut tenant_secret_current = String::new();
        for (version, var) in [
            ("v1", "TENANT_SECRET_KEY"),
            ("v2", "TENANT_SECRET_KEY_V2"),
            ("v3", "TENANT_SECRET_KEY_V3"),
        ] {
            if let Ok(raw) = env::var(var) {
                if raw.is_empty() {
                    continue;
                }
                let bytes = hex::decode(raw.trim())
                    .map_err(|_| anyhow::anyhow!("{var} must be 32 bytes of hex"))?;
                let key: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("{var} must be exactly 32 bytes"))?;
                tenant_secret_keys.insert(version.to_string(), key);
                // Highest configured version wins for new encryptions.
                tenant_secret_current = version.to_string();
            }
        }

        Ok(Self {
            environment,
            database_url: required("DATABASE_URL")?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT").unwrap_or_else(|_| "8080".into()).parse()?,
            app_url: env::var("APP_URL").unwrap_or_else(|_| "http://localhost:8080".into()),
            jwt_private_key,
            access_token_ttl_secs: env::var("ACCESS_TOKEN_TTL_SECONDS")
                .unwrap_or_else(|_| "900".into())
                .parse()?,
            refresh_token_ttl_days: env::var("REFRESH_TOKEN_TTL_DAYS")
                .unwrap_or_else(|_| "7".into())
                .parse()?,
            bcrypt_cost: env::var("BCRYPT_COST").unwrap_or_else(|_| "12".into()).parse()?,
            tenant_secret_keys,
            tenant_secret_current,
            sentry_dsn: env::var("SENTRY_DSN").ok().filter(|s| !s.is_empty()),
            trust_proxy_headers: env::var("TRUST_PROXY_HEADERS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(environment == Environment::Production),
            rate_limit_per_second: env::var("RATE_LIMIT_PER_SECOND")
                .unwrap_or_else(|_| "5".into())
                .parse()?,
            rate_limit_burst: env::var("RATE_LIMIT_BURST")
                .unwrap_or_else(|_| "10".into())
                .parse()?,
            telemetry_url: env::var("TELEMETRY_URL").ok().filter(|s| !s.is_empty()),
            telemetry_deploy_key: env::var("TELEMETRY_DEPLOY_KEY").ok().filter(|s| !s.is_empty()),
            smtp_host: env::var("SMTP_HOST").ok().filter(|s| !s.is_empty()),
            smtp_port: env::var("SMTP_PORT").ok().and_then(|v| v.parse().ok()),
            smtp_username: env::var("SMTP_USERNAME").ok().filter(|s| !s.is_empty()),
            smtp_password: env::var("SMTP_PASSWORD").ok().filter(|s| !s.is_empty()),
            smtp_from: env::var("SMTP_FROM").ok().filter(|s| !s.is_empty()),
        })
    }

    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }
}

fn required(key: &str) -> anyhow::Result<String> {
    env::var(key).map_err(|_| anyhow::anyhow!("Missing required env var: {}", key))
}
