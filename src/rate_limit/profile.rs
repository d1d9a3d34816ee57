//! Rate-limit profiles and the live profile table.
//!
//! A profile is immutable: `{max_requests, window, key_prefix, message}`. The token bucket built
//! from it has `max_tokens = max_requests` and refills `max_requests / window_ms` tokens per
//! millisecond. On the wire the window is `windowMs`.

use crate::dynamic::DynamicConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Reasons a profile is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProfileError {
    #[error("max_requests must be greater than zero")]
    ZeroRequests,
    #[error("window must be at least one millisecond")]
    ZeroWindow,
    #[error("key_prefix must not be empty")]
    EmptyPrefix,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProfile {
    max_requests: u32,
    window_ms: u64,
    key_prefix: String,
    #[serde(default)]
    message: Option<String>,
}

/// Immutable limiter configuration for one call class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawProfile")]
pub struct RateLimitProfile {
    max_requests: u32,
    window_ms: u64,
    key_prefix: String,
    message: String,
}

impl TryFrom<RawProfile> for RateLimitProfile {
    type Error = ProfileError;

    fn try_from(raw: RawProfile) -> Result<Self, Self::Error> {
        let profile = Self::new(
            raw.max_requests,
            Duration::from_millis(raw.window_ms),
            raw.key_prefix,
        )?;
        Ok(match raw.message {
            Some(message) => profile.with_message(message),
            None => profile,
        })
    }
}

impl RateLimitProfile {
    /// Validated profile with the default denial message.
    pub fn new(
        max_requests: u32,
        window: Duration,
        key_prefix: impl Into<String>,
    ) -> Result<Self, ProfileError> {
        let key_prefix = key_prefix.into();
        if max_requests == 0 {
            return Err(ProfileError::ZeroRequests);
        }
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        if window_ms == 0 {
            return Err(ProfileError::ZeroWindow);
        }
        if key_prefix.trim().is_empty() {
            return Err(ProfileError::EmptyPrefix);
        }
        Ok(Self {
            max_requests,
            window_ms,
            key_prefix,
            message: "Too many requests, please try again later.".to_string(),
        })
    }

    /// Message surfaced to callers when this profile denies a request.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Bucket capacity.
    pub fn max_tokens(&self) -> f64 {
        f64::from(self.max_requests)
    }

    /// Tokens accrued per millisecond.
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.max_requests) / self.window_ms as f64
    }

    /// Storage key for `key` under this profile.
    pub fn bucket_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

/// Named profiles, replaceable at runtime. Clones share the table.
#[derive(Debug, Clone)]
pub struct ProfileTable {
    profiles: DynamicConfig<BTreeMap<String, RateLimitProfile>>,
}

impl ProfileTable {
    pub fn new(profiles: BTreeMap<String, RateLimitProfile>) -> Self {
        Self { profiles: DynamicConfig::new(profiles) }
    }

    /// Look up a profile by name.
    pub fn get(&self, name: &str) -> Option<RateLimitProfile> {
        self.profiles.get().get(name).cloned()
    }

    /// Snapshot of the whole table.
    pub fn snapshot(&self) -> Arc<BTreeMap<String, RateLimitProfile>> {
        self.profiles.get()
    }

    pub fn names(&self) -> Vec<String> {
        self.profiles.get().keys().cloned().collect()
    }

    /// Insert or replace a single profile.
    pub fn upsert(&self, name: impl Into<String>, profile: RateLimitProfile) {
        let name = name.into();
        self.profiles.update(|current| {
            let mut next = current.clone();
            next.insert(name.clone(), profile.clone());
            next
        });
        tracing::info!(profile = %name, "rate limit profile updated");
    }

    /// Swap the whole table.
    pub fn replace(&self, profiles: BTreeMap<String, RateLimitProfile>) {
        let count = profiles.len();
        self.profiles.set(profiles);
        tracing::info!(count, "rate limit profile table replaced");
    }
}

impl Default for ProfileTable {
    /// The built-in profiles from [`crate::presets::profiles`].
    fn default() -> Self {
        Self::new(crate::presets::profiles())
    }
}
