//! Production-ready defaults.
//!
//! ## Available Presets
//!
//! - [`profiles`]: the named rate-limit profile table
//! - [`standard_retry`]: classifier-driven retry for HTTP calls and the like
//! - [`remote_procedure_retry`]: retry for structured remote-procedure calls (GraphQL and the
//!   like), which never retries deterministic failures
//! - [`throttled_retry`]: retry that waits on an [`AdaptiveQuota`] when throttled
//! - [`default_breaker_config`]: breaker used by [`CircuitBreakerRegistry::default`]
//!
//! ```rust
//! use backstop::presets;
//!
//! let profiles = presets::profiles();
//! let auth = &profiles["auth"];
//! assert_eq!(auth.max_requests(), 5);
//! assert_eq!(auth.window().as_secs(), 15 * 60);
//! ```
//!
//! [`CircuitBreakerRegistry::default`]: crate::CircuitBreakerRegistry

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::classify::Classify;
use crate::quota::AdaptiveQuota;
use crate::rate_limit::RateLimitProfile;
use crate::retry::RetryPolicyBuilder;
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: usize = 3;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

pub const DEFAULT_BREAKER_THRESHOLD: usize = 5;
pub const DEFAULT_BREAKER_COOLDOWN: Duration = Duration::from_secs(60);

const REMOTE_PROCEDURE_INITIAL_DELAY: Duration = Duration::from_millis(500);
const REMOTE_PROCEDURE_MAX_DELAY: Duration = Duration::from_secs(10);

const MINUTE: u64 = 60 * 1000;

struct ProfileSpec {
    name: &'static str,
    max_requests: u32,
    window_ms: u64,
    key_prefix: &'static str,
    message: &'static str,
}

const PROFILES: &[ProfileSpec] = &[
    ProfileSpec {
        name: "api",
        max_requests: 100,
        window_ms: 15 * MINUTE,
        key_prefix: "rl:api",
        message: "Too many requests. Please slow down and try again later.",
    },
    ProfileSpec {
        name: "auth",
        max_requests: 5,
        window_ms: 15 * MINUTE,
        key_prefix: "rl:auth",
        message: "Too many login attempts. Please wait before trying again.",
    },
    ProfileSpec {
        name: "shopify_burst",
        max_requests: 40,
        window_ms: 1000,
        key_prefix: "rl:shopify:burst",
        message: "Shopify request burst limit reached. Requests are being queued.",
    },
    ProfileSpec {
        name: "shopify_cost",
        max_requests: 1000,
        window_ms: 20 * 1000,
        key_prefix: "rl:shopify:cost",
        message: "Shopify query cost budget exhausted. Please wait for it to restore.",
    },
    ProfileSpec {
        name: "ai",
        max_requests: 10,
        window_ms: MINUTE,
        key_prefix: "rl:ai",
        message: "AI request limit reached. Please wait a moment before generating more content.",
    },
    ProfileSpec {
        name: "upload",
        max_requests: 20,
        window_ms: 60 * MINUTE,
        key_prefix: "rl:upload",
        message: "Upload limit reached. Please try again later.",
    },
    ProfileSpec {
        name: "webhook",
        max_requests: 100,
        window_ms: MINUTE,
        key_prefix: "rl:webhook",
        message: "Webhook rate limit exceeded.",
    },
    ProfileSpec {
        name: "public_api",
        max_requests: 30,
        window_ms: MINUTE,
        key_prefix: "rl:public",
        message: "Public API rate limit exceeded. Authenticate for higher limits.",
    },
];

/// The built-in named profile table.
pub fn profiles() -> BTreeMap<String, RateLimitProfile> {
    PROFILES
        .iter()
        .filter_map(|spec| {
            RateLimitProfile::new(
                spec.max_requests,
                Duration::from_millis(spec.window_ms),
                spec.key_prefix,
            )
            .ok()
            .map(|profile| (spec.name.to_string(), profile.with_message(spec.message)))
        })
        .collect()
}

/// Classifier-driven retry: 3 retries, 1 s doubling up to 30 s, 10% jitter.
pub fn standard_retry<E>() -> RetryPolicyBuilder<E>
where
    E: Classify + Send + Sync + 'static,
{
    RetryPolicyBuilder::new()
}

/// Retry for structured remote-procedure calls: 3 retries, 500 ms doubling up to 10 s.
pub fn remote_procedure_retry<E>() -> RetryPolicyBuilder<E>
where
    E: Classify + Send + Sync + 'static,
{
    RetryPolicyBuilder::remote_procedure()
        .initial_delay(REMOTE_PROCEDURE_INITIAL_DELAY)
        .max_delay(REMOTE_PROCEDURE_MAX_DELAY)
}

/// Remote-procedure retry that asks `quota` how long to wait when throttled without a hint.
pub fn throttled_retry<E>(quota: AdaptiveQuota) -> RetryPolicyBuilder<E>
where
    E: Classify + Send + Sync + 'static,
{
    remote_procedure_retry().with_quota(quota)
}

/// Five consecutive failures open the circuit for a minute.
pub fn default_breaker_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig::new(DEFAULT_BREAKER_THRESHOLD, DEFAULT_BREAKER_COOLDOWN)
        .unwrap_or_else(|_| CircuitBreakerConfig::disabled())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    #[test]
    fn profile_table_matches_documented_limits() {
        let table = profiles();
        let limits: Vec<(&str, u32, u64)> = table
            .iter()
            .map(|(name, p)| (name.as_str(), p.max_requests(), p.window().as_millis() as u64))
            .collect();
        assert_eq!(
            limits,
            vec![
                ("ai", 10, 60_000),
                ("api", 100, 900_000),
                ("auth", 5, 900_000),
                ("public_api", 30, 60_000),
                ("shopify_burst", 40, 1_000),
                ("shopify_cost", 1000, 20_000),
                ("upload", 20, 3_600_000),
                ("webhook", 100, 60_000),
            ]
        );
    }

    #[test]
    fn prefixes_are_unique_and_messages_present() {
        let table = profiles();
        let mut prefixes: Vec<&str> = table.values().map(|p| p.key_prefix()).collect();
        prefixes.sort_unstable();
        prefixes.dedup();
        assert_eq!(prefixes.len(), table.len());
        assert!(table.values().all(|p| !p.message().is_empty()));
    }

    #[test]
    fn retry_presets_build() {
        let standard = standard_retry::<AppError>().build().unwrap();
        assert_eq!(standard.max_retries(), DEFAULT_MAX_RETRIES);
        assert_eq!(standard.max_delay(), DEFAULT_MAX_DELAY);

        let rpc = remote_procedure_retry::<AppError>().build().unwrap();
        assert_eq!(rpc.max_delay(), Duration::from_secs(10));

        let throttled = throttled_retry::<AppError>(AdaptiveQuota::default()).build();
        assert!(throttled.is_ok());
    }

    #[test]
    fn default_breaker_is_enabled() {
        let config = default_breaker_config();
        assert_eq!(config.threshold(), 5);
        assert_eq!(config.cooldown(), Duration::from_secs(60));
    }
}
