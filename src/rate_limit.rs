//! Keyed token-bucket admission control.
//!
//! - [`RateLimiter`]: checks a `(key, profile)` pair against its bucket.
//! - [`RateLimitDecision`]: the result of a check, renderable as response headers.
//! - [`BucketStore`]: where bucket state lives; [`InMemoryBucketStore`] by default.
//! - [`RateLimitLayer`]: tower middleware that performs the check before calling a service.
//!
//! Semantics:
//! - Buckets are created full on the first check of a key and stored under
//!   `<profile.key_prefix>:<key>`.
//! - Each check refills `elapsed_ms * refill_rate` tokens (capped at `max_tokens`), then admits
//!   and consumes one token if at least one whole token is available.
//! - Tokens are fractional; only the admission decision truncates.
//! - The refill-decide-write cycle for one key is committed with compare-and-set on the bucket
//!   version, so concurrent checks of the same key never interleave their updates.
//! - Store failures fail open: the call is admitted and a warning is logged.
//!
//! Two entry points over the same state:
//! - [`RateLimiter::check_rate_limit`] returns the decision (soft enforcement, headers only).
//! - [`RateLimiter::rate_limit`] turns a denial into a [`RateLimitError`] (hard stop).

use crate::clock::{Clock, SystemClock};
use crate::error::{ceil_secs, RateLimitError};
use crate::telemetry::{PolicyEvent, RateLimitEvent, Telemetry};
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

pub mod client;
pub mod middleware;
pub mod profile;
pub mod store;

pub use client::{client_identifier, HeaderSource};
pub use middleware::{RateLimitLayer, RateLimitService};
pub use profile::{ProfileError, ProfileTable, RateLimitProfile};
pub use store::{BucketState, BucketStore, InMemoryBucketStore};

/// Buckets untouched for this long are evicted.
pub const DEFAULT_IDLE_EVICTION: Duration = Duration::from_secs(10 * 60);

/// Compare-and-set attempts before a check gives up on a contended key.
const MAX_CAS_ATTEMPTS: usize = 8;

/// Wait suggested to a caller denied because its key stayed contended.
const CONTENTION_RETRY: Duration = Duration::from_millis(10);

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Bucket capacity (`X-RateLimit-Limit`).
    pub limit: u32,
    /// Whole tokens left after this check (`X-RateLimit-Remaining`).
    pub remaining: u32,
    /// Epoch milliseconds at which the bucket is full again (`X-RateLimit-Reset`).
    pub reset_at_ms: u64,
    /// Set on denial: time until at least one token accrues.
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    fn from_state(state: &BucketState, allowed: bool, now_ms: u64) -> Self {
        let missing = (state.max_tokens - state.tokens).max(0.0);
        let reset_at_ms = now_ms.saturating_add(ceil_ms(missing / state.refill_rate));
        let retry_after = (!allowed).then(|| {
            let deficit = (1.0 - state.tokens).max(0.0);
            Duration::from_millis(ceil_ms(deficit / state.refill_rate).max(1))
        });
        Self {
            allowed,
            limit: state.max_tokens as u32,
            remaining: state.tokens.floor().max(0.0) as u32,
            reset_at_ms,
            retry_after,
        }
    }

    fn fail_open(profile: &RateLimitProfile, now_ms: u64) -> Self {
        Self {
            allowed: true,
            limit: profile.max_requests(),
            remaining: profile.max_requests(),
            reset_at_ms: now_ms,
            retry_after: None,
        }
    }

    fn contended(profile: &RateLimitProfile, now_ms: u64) -> Self {
        Self {
            allowed: false,
            limit: profile.max_requests(),
            remaining: 0,
            reset_at_ms: now_ms,
            retry_after: Some(CONTENTION_RETRY),
        }
    }

    /// `X-RateLimit-*` headers, plus `Retry-After` (whole seconds, rounded up) on denial.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let reset = DateTime::<Utc>::from_timestamp_millis(self.reset_at_ms as i64)
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_default();
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", reset),
        ];
        if let Some(wait) = self.retry_after.filter(|_| !self.allowed) {
            headers.push(("Retry-After", ceil_secs(wait).to_string()));
        }
        headers
    }

    /// Convert a denial into the error raised by [`RateLimiter::rate_limit`].
    pub fn into_result(self, profile: &RateLimitProfile) -> Result<Self, RateLimitError> {
        if self.allowed {
            return Ok(self);
        }
        Err(RateLimitError {
            message: profile.message().to_string(),
            retry_after: self.retry_after.unwrap_or(CONTENTION_RETRY),
            limit: self.limit,
            remaining: self.remaining,
            reset_at_ms: self.reset_at_ms,
        })
    }
}

/// Round a fractional millisecond count up, ignoring float noise below a nanosecond.
fn ceil_ms(ms: f64) -> u64 {
    let nearest = ms.round();
    if (ms - nearest).abs() < 1e-6 {
        nearest as u64
    } else {
        ms.ceil() as u64
    }
}

/// Keyed token-bucket limiter. Clones share the store.
pub struct RateLimiter<S = InMemoryBucketStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
    idle_after: Duration,
}

impl<S> Clone for RateLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            telemetry: self.telemetry.clone(),
            idle_after: self.idle_after,
        }
    }
}

impl Default for RateLimiter<InMemoryBucketStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter<InMemoryBucketStore> {
    /// In-memory limiter on the wall clock.
    pub fn new() -> Self {
        Self::with_store(InMemoryBucketStore::new())
    }
}

impl<S> std::fmt::Debug for RateLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("clock", &self.clock)
            .field("idle_after", &self.idle_after)
            .finish_non_exhaustive()
    }
}

impl<S: BucketStore> RateLimiter<S> {
    pub fn with_store(store: S) -> Self {
        Self {
            store: Arc::new(store),
            clock: Arc::new(SystemClock),
            telemetry: Telemetry::null(),
            idle_after: DEFAULT_IDLE_EVICTION,
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Idle period after which a bucket is evicted.
    pub fn with_idle_eviction(mut self, idle_after: Duration) -> Self {
        self.idle_after = idle_after;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Admission check: refill, decide, consume on success.
    pub async fn check_rate_limit(&self, key: &str, profile: &RateLimitProfile) -> RateLimitDecision {
        let bucket_key = profile.bucket_key(key);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now_millis();
            let loaded = match self.store.load(&bucket_key).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    tracing::warn!(key = %bucket_key, error = %e, "bucket store load failed; admitting");
                    return RateLimitDecision::fail_open(profile, now);
                }
            };

            let (current, expected_version) = match loaded {
                Some(state) => {
                    // Follow the live profile if it was replaced since the bucket was created.
                    let state = BucketState {
                        max_tokens: profile.max_tokens(),
                        refill_rate: profile.refill_rate(),
                        ..state
                    };
                    (state, state.version)
                }
                None => (BucketState::full(profile.max_tokens(), profile.refill_rate(), now), 0),
            };

            let refilled = current.refilled(now);
            let allowed = refilled.tokens >= 1.0;
            let next = if allowed {
                BucketState { tokens: refilled.tokens - 1.0, ..refilled }
            } else {
                refilled
            };

            match self.store.compare_and_set(&bucket_key, expected_version, next).await {
                Ok(true) => {
                    let decision = RateLimitDecision::from_state(&next, allowed, now);
                    if !allowed {
                        self.report_denial(&bucket_key, &decision).await;
                    }
                    return decision;
                }
                Ok(false) => {
                    tracing::trace!(key = %bucket_key, "bucket version conflict; recomputing");
                }
                Err(e) => {
                    tracing::warn!(key = %bucket_key, error = %e, "bucket store write failed; admitting");
                    return RateLimitDecision::fail_open(profile, now);
                }
            }
        }

        tracing::warn!(key = %bucket_key, attempts = MAX_CAS_ATTEMPTS, "bucket contended; denying");
        let decision = RateLimitDecision::contended(profile, self.clock.now_millis());
        self.report_denial(&bucket_key, &decision).await;
        decision
    }

    /// Hard-stop variant of [`RateLimiter::check_rate_limit`].
    pub async fn rate_limit(
        &self,
        key: &str,
        profile: &RateLimitProfile,
    ) -> Result<RateLimitDecision, RateLimitError> {
        self.check_rate_limit(key, profile).await.into_result(profile)
    }

    /// Remove buckets idle for longer than the eviction period. Returns how many were removed.
    pub async fn evict_idle(&self) -> usize {
        evict(&*self.store, &*self.clock, self.idle_after).await
    }

    /// Number of live buckets, or 0 if the store cannot tell.
    pub async fn bucket_count(&self) -> usize {
        self.store.len().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "bucket store len failed");
            0
        })
    }

    async fn report_denial(&self, bucket_key: &str, decision: &RateLimitDecision) {
        let retry_after = decision.retry_after.unwrap_or_default();
        tracing::warn!(key = %bucket_key, retry_after_ms = retry_after.as_millis() as u64, "rate limit exceeded");
        self.telemetry
            .emit(PolicyEvent::RateLimit(RateLimitEvent::Denied {
                key: bucket_key.to_string(),
                retry_after,
            }))
            .await;
    }
}

impl<S: BucketStore + 'static> RateLimiter<S> {
    /// Run [`RateLimiter::evict_idle`] every `interval` on the tokio runtime.
    ///
    /// The task ends once every handle to this limiter has been dropped.
    pub fn spawn_eviction(&self, interval: Duration) -> JoinHandle<()> {
        let store: Weak<S> = Arc::downgrade(&self.store);
        let clock = self.clock.clone();
        let idle_after = self.idle_after;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    tracing::debug!("rate limiter dropped; stopping eviction sweep");
                    break;
                };
                evict(&*store, &*clock, idle_after).await;
            }
        })
    }
}

async fn evict<S: BucketStore + ?Sized>(store: &S, clock: &dyn Clock, idle_after: Duration) -> usize {
    let idle_ms = u64::try_from(idle_after.as_millis()).unwrap_or(u64::MAX);
    let cutoff = clock.now_millis().saturating_sub(idle_ms);
    match store.evict_idle(cutoff).await {
        Ok(0) => 0,
        Ok(removed) => {
            tracing::debug!(removed, "evicted idle rate limit buckets");
            removed
        }
        Err(e) => {
            tracing::warn!(error = %e, "bucket eviction failed");
            0
        }
    }
}
