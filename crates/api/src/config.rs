//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Redis
    pub redis_url: String,

    // Authentication
    pub jwt_secret: String,
    /// Access token lifetime in seconds. Also bounds session-record and
    /// presence TTLs.
    pub access_token_ttl_secs: u64,
    /// Refresh token lifetime in seconds.
    pub refresh_token_ttl_secs: u64,
    /// Email verification token lifetime in seconds.
    pub verification_token_ttl_secs: u64,
    /// Password reset token lifetime in seconds.
    pub reset_token_ttl_secs: u64,

    // Realtime
    /// Pub/sub channel all processes share for cross-process fan-out.
    pub broadcast_channel: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8001".to_string()),

            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),

            jwt_secret: {
                let secret =
                    env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
                // Signing key must be cryptographically strong
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },
            access_token_ttl_secs: parse_env_u64("ACCESS_TOKEN_TTL_SECS", 1800),
            refresh_token_ttl_secs: parse_env_u64("REFRESH_TOKEN_TTL_SECS", 30 * 24 * 3600),
            verification_token_ttl_secs: parse_env_u64("VERIFICATION_TOKEN_TTL_SECS", 24 * 3600),
            reset_token_ttl_secs: parse_env_u64("RESET_TOKEN_TTL_SECS", 1800),

            broadcast_channel: env::var("BROADCAST_CHANNEL")
                .unwrap_or_else(|_| "notifications:events".to_string()),
        })
    }
}

fn parse_env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("{0}")]
    WeakSecret(&'static str),
}
