//! Metering configuration.

use crate::rates::ModelRates;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Which ledger is authoritative for balances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerMode {
    /// The remote metering authority owns balances; admission goes through the cache.
    Remote,
    /// Self-hosted accounting against the local optimistic ledger.
    Local,
}

/// Main metering configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MeteringConfig {
    /// Active ledger.
    #[serde(default = "default_mode")]
    pub mode: LedgerMode,

    /// Pricing configuration.
    #[serde(default)]
    pub pricing: PricingConfig,

    /// Balance cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Local ledger configuration.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Remote balance authority.
    pub remote: Option<RemoteConfig>,

    /// Path for the JSON-lines transaction log. In-memory when unset.
    #[serde(default)]
    pub transaction_log_path: Option<PathBuf>,
}

fn default_mode() -> LedgerMode {
    LedgerMode::Local
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            pricing: PricingConfig::default(),
            cache: CacheConfig::default(),
            ledger: LedgerConfig::default(),
            remote: None,
            transaction_log_path: None,
        }
    }
}

/// Pricing configuration for token-to-credit conversion.
#[derive(Debug, Clone, Deserialize)]
pub struct PricingConfig {
    /// USD value of one credit.
    /// Default: 0.01 (1 credit = 1 cent)
    #[serde(default = "default_credit_unit_price")]
    pub credit_unit_price: f64,

    /// Charges below this many credits are dropped entirely.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,

    /// Charge applied to any amount between `epsilon` and one credit.
    #[serde(default = "default_minimum_charge")]
    pub minimum_charge: f64,

    /// Multiplier for completions recorded as incomplete. Must exceed 1.0.
    #[serde(default = "default_cancel_rate")]
    pub cancel_rate: f64,

    /// Rates (USD per million tokens) for models not matched by `models`.
    #[serde(default = "default_rate")]
    pub default_rate: ModelRates,

    /// Per-model overrides, merged over the built-in table.
    #[serde(default)]
    pub models: HashMap<String, ModelRates>,
}

fn default_credit_unit_price() -> f64 {
    0.01
}

fn default_epsilon() -> f64 {
    0.001
}

fn default_minimum_charge() -> f64 {
    0.01
}

fn default_cancel_rate() -> f64 {
    1.15
}

fn default_rate() -> ModelRates {
    ModelRates::new(6.0, 6.0)
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            credit_unit_price: default_credit_unit_price(),
            epsilon: default_epsilon(),
            minimum_charge: default_minimum_charge(),
            cancel_rate: default_cancel_rate(),
            default_rate: default_rate(),
            models: HashMap::new(),
        }
    }
}

impl PricingConfig {
    /// Reject settings that would break the rounding or cancel-rate contracts.
    pub fn validate(&self) -> Result<(), crate::MeteringError> {
        if self.credit_unit_price.is_nan() || self.credit_unit_price <= 0.0 {
            return Err(crate::MeteringError::Config(
                "credit_unit_price must be positive".into(),
            ));
        }
        if self.cancel_rate <= 1.0 {
            return Err(crate::MeteringError::Config(format!(
                "cancel_rate must exceed 1.0, got {}",
                self.cancel_rate
            )));
        }
        if self.epsilon < 0.0 || self.minimum_charge < self.epsilon {
            return Err(crate::MeteringError::Config(
                "minimum_charge must be at least epsilon, and epsilon non-negative".into(),
            ));
        }
        Ok(())
    }
}

/// Metered balance cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// How long an observed remote balance is trusted without refetching.
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// How long an unreleased reservation holds capacity. Defaults to `ttl`.
    #[serde(default, with = "humantime_serde")]
    pub pending_ttl: Option<Duration>,

    /// Oldest authoritative fetch still trusted when the authority is unreachable.
    #[serde(default = "default_max_staleness", with = "humantime_serde")]
    pub max_staleness: Duration,

    /// Interval of the background sweep evicting stale, unreserved entries.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(10)
}

fn default_max_staleness() -> Duration {
    Duration::from_secs(60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
            pending_ttl: None,
            max_staleness: default_max_staleness(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl CacheConfig {
    /// Effective reservation lifetime.
    pub fn pending_ttl(&self) -> Duration {
        self.pending_ttl.unwrap_or(self.ttl)
    }
}

/// Local optimistic ledger configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Maximum compare-and-swap attempts per update.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay.
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Backoff cap.
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Path of the balance file. In-memory when unset.
    #[serde(default)]
    pub storage_path: Option<PathBuf>,

    /// Credits granted to a record the first time a user is seen.
    #[serde(default)]
    pub start_balance: f64,
}

fn default_max_attempts() -> u32 {
    10
}

fn default_base_delay() -> Duration {
    Duration::from_millis(50)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(2)
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            storage_path: None,
            start_balance: 0.0,
        }
    }
}

/// Remote balance authority configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the metering authority.
    pub base_url: String,

    /// API key presented as a bearer token.
    pub api_key: String,

    /// Per-call timeout. Calls exceeding it fall back to the cache.
    #[serde(default = "default_remote_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_remote_timeout() -> Duration {
    Duration::from_secs(3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MeteringConfig::default();
        assert_eq!(config.mode, LedgerMode::Local);
        assert_eq!(config.cache.ttl, Duration::from_secs(10));
        assert_eq!(config.cache.pending_ttl(), Duration::from_secs(10));
        assert_eq!(config.ledger.max_attempts, 10);
        assert_eq!(config.ledger.base_delay, Duration::from_millis(50));
        assert_eq!(config.ledger.max_delay, Duration::from_secs(2));
        assert!(config.pricing.validate().is_ok());
    }

    #[test]
    fn test_pricing_validation_rejects_discounted_cancel_rate() {
        let pricing = PricingConfig {
            cancel_rate: 0.9,
            ..PricingConfig::default()
        };
        assert!(pricing.validate().is_err());
    }

    #[test]
    fn test_deserialize_with_humantime() {
        let json = serde_json::json!({
            "mode": "remote",
            "cache": { "ttl": "5s", "pending_ttl": "2s", "max_staleness": "30s" },
            "remote": { "base_url": "http://authority", "api_key": "k", "timeout": "500ms" }
        });

        let config: MeteringConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.mode, LedgerMode::Remote);
        assert_eq!(config.cache.ttl, Duration::from_secs(5));
        assert_eq!(config.cache.pending_ttl(), Duration::from_secs(2));
        assert_eq!(
            config.remote.unwrap().timeout,
            Duration::from_millis(500)
        );
    }
}
