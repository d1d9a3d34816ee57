//! JSON configuration for the whole layer.
//!
//! Every section is optional; missing values fall back to [`crate::presets`]. Profiles listed
//! under `profiles` are merged over the built-in table unless `builtinProfiles` is `false`.
//!
//! ```rust
//! use backstop::ResilienceConfig;
//!
//! let config = ResilienceConfig::from_json(r#"{
//!     "profiles": { "search": { "maxRequests": 50, "windowMs": 60000, "keyPrefix": "rl:search" } },
//!     "retry": { "maxRetries": 5 },
//!     "circuitBreaker": { "threshold": 3, "cooldownMs": 30000 }
//! }"#).unwrap();
//! let table = config.profile_table();
//! assert!(table.get("search").is_some());
//! assert!(table.get("auth").is_some());
//! ```

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError};
use crate::classify::Classify;
use crate::quota::{QuotaError, QuotaRegistry, DEFAULT_MAX_CALLS, DEFAULT_RESTORE_RATE};
use crate::rate_limit::{ProfileTable, RateLimitProfile};
use crate::retry::{BuildError, RetryPolicy, RetryPolicyBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid retry settings: {0}")]
    Retry(#[from] BuildError),
    #[error("invalid circuit breaker settings: {0}")]
    CircuitBreaker(#[from] CircuitBreakerError),
    #[error("invalid quota settings: {0}")]
    Quota(#[from] QuotaError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_retries: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub use_jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: crate::presets::DEFAULT_MAX_RETRIES,
            initial_delay_ms: crate::presets::DEFAULT_INITIAL_DELAY.as_millis() as u64,
            max_delay_ms: crate::presets::DEFAULT_MAX_DELAY.as_millis() as u64,
            backoff_multiplier: crate::presets::DEFAULT_BACKOFF_MULTIPLIER,
            use_jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct BreakerSettings {
    pub threshold: usize,
    pub cooldown_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            threshold: crate::presets::DEFAULT_BREAKER_THRESHOLD,
            cooldown_ms: crate::presets::DEFAULT_BREAKER_COOLDOWN.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct QuotaSettings {
    pub max_calls: f64,
    /// Calls restored per second.
    pub restore_rate: f64,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self { max_calls: DEFAULT_MAX_CALLS, restore_rate: DEFAULT_RESTORE_RATE }
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ResilienceConfig {
    pub builtin_profiles: bool,
    pub profiles: BTreeMap<String, RateLimitProfile>,
    pub retry: RetrySettings,
    pub circuit_breaker: BreakerSettings,
    pub quota: QuotaSettings,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            builtin_profiles: true,
            profiles: BTreeMap::new(),
            retry: RetrySettings::default(),
            circuit_breaker: BreakerSettings::default(),
            quota: QuotaSettings::default(),
        }
    }
}

impl ResilienceConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check every section without building anything long-lived.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry_builder::<String>().build()?;
        self.breaker_config()?;
        QuotaRegistry::new().with_defaults(self.quota.max_calls, self.quota.restore_rate)?;
        tracing::debug!(
            profiles = self.profiles().len(),
            max_retries = self.retry.max_retries,
            threshold = self.circuit_breaker.threshold,
            "configuration validated"
        );
        Ok(())
    }

    /// Built-in profiles (unless disabled) overlaid with the configured ones.
    pub fn profiles(&self) -> BTreeMap<String, RateLimitProfile> {
        let mut table =
            if self.builtin_profiles { crate::presets::profiles() } else { BTreeMap::new() };
        table.extend(self.profiles.iter().map(|(name, p)| (name.clone(), p.clone())));
        table
    }

    /// Live-swappable table seeded from [`ResilienceConfig::profiles`].
    pub fn profile_table(&self) -> ProfileTable {
        ProfileTable::new(self.profiles())
    }

    /// Retry builder carrying the configured schedule. Add a sleeper or telemetry before building.
    pub fn retry_builder<E>(&self) -> RetryPolicyBuilder<E>
    where
        E: Classify + Send + Sync + 'static,
    {
        RetryPolicy::builder()
            .max_retries(self.retry.max_retries)
            .initial_delay(Duration::from_millis(self.retry.initial_delay_ms))
            .max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .backoff_multiplier(self.retry.backoff_multiplier)
            .use_jitter(self.retry.use_jitter)
    }

    pub fn breaker_config(&self) -> Result<CircuitBreakerConfig, CircuitBreakerError> {
        CircuitBreakerConfig::new(
            self.circuit_breaker.threshold,
            Duration::from_millis(self.circuit_breaker.cooldown_ms),
        )
    }

    pub fn quota_registry(&self) -> Result<QuotaRegistry, QuotaError> {
        QuotaRegistry::new().with_defaults(self.quota.max_calls, self.quota.restore_rate)
    }
}
