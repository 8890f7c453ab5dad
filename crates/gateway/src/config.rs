//! Gateway configuration loaded from environment variables.

use anyhow::{Context, Result};
use credential_broker::RefreshConfig;
use credit_ledger::MeteringConfig;
use serde::Deserialize;
use std::time::Duration;

/// Gateway configuration.
///
/// Keys are nested with `__`, e.g. `UPSTREAM__MODEL`, `METERING__CACHE__TTL`,
/// `REFRESH__TOKEN_URL`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Upstream model API
    pub upstream: UpstreamConfig,

    /// Credit metering
    #[serde(default)]
    pub metering: MeteringConfig,

    /// Upstream credential refresh
    pub refresh: RefreshConfig,

    /// Process-level settings
    #[serde(default)]
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// API base URL
    #[serde(default = "default_upstream_url")]
    pub base_url: String,

    /// Model requested for every completion
    #[serde(default = "default_model")]
    pub model: String,

    /// Request timeout
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Retries for transient upstream failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Prepended to every conversation when set
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Log level, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

fn default_upstream_url() -> String {
    "https://api.openai.com/v1".into()
}

fn default_model() -> String {
    "gpt-4o-mini".into()
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_retries() -> u32 {
    2
}

fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let builder = config::Config::builder().add_source(
            config::Environment::default()
                .separator("__")
                // Secrets and keys stay strings; typed fields are parsed on deserialize.
                .try_parsing(false),
        );
        Self::from_builder(builder)
    }

    fn from_builder(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }
}
