//! Refresh configuration.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Credential refresh configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Provider identifier the credentials are stored under.
    #[serde(default = "default_provider")]
    pub provider: String,

    /// OAuth token endpoint.
    pub token_url: String,

    pub client_id: String,

    #[serde(default)]
    pub client_secret: Option<String>,

    /// Access tokens expiring within this window are refreshed early.
    #[serde(default = "default_skew_buffer", with = "humantime_serde")]
    pub skew_buffer: Duration,

    /// Lifetime given to a rotated refresh token when the endpoint does not report one.
    #[serde(default = "default_refresh_ttl", with = "humantime_serde")]
    pub refresh_ttl: Duration,

    /// Token endpoint request timeout.
    #[serde(default = "default_exchange_timeout", with = "humantime_serde")]
    pub exchange_timeout: Duration,

    /// 64 hex characters, or a passphrase hashed with SHA-256.
    pub encryption_key: String,

    /// Credential file. In-memory when unset.
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
}

fn default_provider() -> String {
    "openid".to_string()
}

fn default_skew_buffer() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_refresh_ttl() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_exchange_timeout() -> Duration {
    Duration::from_secs(10)
}

impl RefreshConfig {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        encryption_key: impl Into<String>,
    ) -> Self {
        Self {
            provider: default_provider(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: None,
            skew_buffer: default_skew_buffer(),
            refresh_ttl: default_refresh_ttl(),
            exchange_timeout: default_exchange_timeout(),
            encryption_key: encryption_key.into(),
            storage_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: RefreshConfig = serde_json::from_value(serde_json::json!({
            "token_url": "https://auth.example.com/token",
            "client_id": "gateway",
            "encryption_key": "passphrase"
        }))
        .unwrap();

        assert_eq!(config.provider, "openid");
        assert_eq!(config.skew_buffer, Duration::from_secs(300));
        assert!(config.client_secret.is_none());
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_humantime_durations() {
        let config: RefreshConfig = serde_json::from_value(serde_json::json!({
            "token_url": "https://auth.example.com/token",
            "client_id": "gateway",
            "encryption_key": "k",
            "skew_buffer": "90s",
            "refresh_ttl": "30days"
        }))
        .unwrap();

        assert_eq!(config.skew_buffer, Duration::from_secs(90));
        assert_eq!(config.refresh_ttl, Duration::from_secs(30 * 24 * 60 * 60));
    }
}
