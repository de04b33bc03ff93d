//! Runtime configuration loaded from environment variables.
//!
//! All options are resolved once at startup into an immutable [`Config`]
//! that is passed explicitly to the components that need it. Components
//! never read the environment themselves.

use std::env;

use anyhow::{bail, Context};

/// Default HTTP listen port.
const DEFAULT_PORT: u16 = 8080;

/// Default database if `DATABASE_URL` is not set.
const DEFAULT_DATABASE_URL: &str = "sqlite:safehorizon.db?mode=rwc";

/// Default token validity in minutes (24 hours).
const DEFAULT_JWT_EXPIRY_MIN: i64 = 1440;

/// Default zone snapshot refresh interval in seconds.
const DEFAULT_SCORE_REFRESH_SECS: u64 = 30;

/// Default idle timeout for subscription sessions in seconds.
const DEFAULT_SESSION_IDLE_SECS: u64 = 120;

/// Immutable application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port.
    pub port: u16,
    /// Connection string for the durable store.
    pub database_url: String,
    /// Pub/sub broker endpoint. `None` degrades the hub to local-only delivery.
    pub broker_url: Option<String>,
    /// HMAC signing key for tokens. Must be at least 32 bytes.
    pub jwt_secret: String,
    /// Token validity in minutes.
    pub jwt_expiry_min: i64,
    /// CORS allowlist. `["*"]` permits any origin.
    pub allowed_origins: Vec<String>,
    /// Zone snapshot refresh interval in seconds.
    pub score_refresh_secs: u64,
    /// Subscription session idle timeout in seconds.
    pub session_idle_secs: u64,
    /// Path to push-notification credentials, opaque to the core.
    pub push_credentials_path: Option<String>,
    /// Sender number for SMS dispatch, opaque to the core.
    pub sms_from_number: Option<String>,
}

impl Config {
    /// Build the configuration from the process environment.
    ///
    /// Fails if `JWT_SECRET` is missing or shorter than 32 bytes; every
    /// other option has a default.
    pub fn from_env() -> anyhow::Result<Self> {
        let jwt_secret = env::var("JWT_SECRET").context("JWT_SECRET is required")?;
        if jwt_secret.len() < 32 {
            bail!("JWT_SECRET must be at least 32 bytes");
        }

        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_else(|_| vec!["*".to_string()]);

        Ok(Self {
            port,
            database_url,
            broker_url: env::var("BROKER_URL").ok(),
            jwt_secret,
            jwt_expiry_min: env::var("JWT_EXPIRY_MIN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_JWT_EXPIRY_MIN),
            allowed_origins,
            score_refresh_secs: env::var("SCORE_REFRESH_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_SCORE_REFRESH_SECS),
            session_idle_secs: env::var("SESSION_IDLE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_SESSION_IDLE_SECS),
            push_credentials_path: env::var("PUSH_CREDENTIALS_PATH").ok(),
            sms_from_number: env::var("SMS_FROM_NUMBER").ok(),
        })
    }

    /// A configuration suitable for tests: in-memory database, no broker.
    pub fn for_tests() -> Self {
        Self {
            port: 0,
            database_url: "sqlite::memory:".to_string(),
            broker_url: None,
            jwt_secret: "test-secret-0123456789abcdef0123456789abcdef".to_string(),
            jwt_expiry_min: DEFAULT_JWT_EXPIRY_MIN,
            allowed_origins: vec!["*".to_string()],
            score_refresh_secs: DEFAULT_SCORE_REFRESH_SECS,
            session_idle_secs: DEFAULT_SESSION_IDLE_SECS,
            push_credentials_path: None,
            sms_from_number: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_secret_rejected() {
        // Config validation happens on the value, not the env var itself
        let cfg = Config::for_tests();
        assert!(cfg.jwt_secret.len() >= 32);
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::for_tests();
        assert_eq!(cfg.jwt_expiry_min, 1440);
        assert_eq!(cfg.score_refresh_secs, 30);
        assert_eq!(cfg.session_idle_secs, 120);
        assert!(cfg.broker_url.is_none());
    }
}
