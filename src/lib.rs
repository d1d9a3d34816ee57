#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # backstop
//!
//! Resilience layer for async services that sit between your own callers and remote APIs.
//!
//! ## Features
//!
//! - **Keyed token buckets** for admission control, with named profiles, `X-RateLimit-*`
//!   headers and a pluggable [`BucketStore`]
//! - **Adaptive quotas** that wait out a remote service's leaky bucket and resync from the
//!   `"used/max"` counters it reports
//! - **Error classification** into a closed taxonomy, structurally first and by message text
//!   for opaque third-party errors
//! - **Retry** with exponential backoff, additive jitter and rate-limit hints
//! - **Circuit breakers** with a single half-open trial, plus a named registry
//! - **Response envelopes** for the boundary
//!
//! ## Quick Start
//!
//! ```rust
//! use backstop::{AppError, ResilienceStack, RetryPolicy, RateLimiter, presets};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = RateLimiter::new();
//!     let profiles = presets::profiles();
//!     let stack = ResilienceStack::builder()
//!         .retry(
//!             RetryPolicy::builder()
//!                 .max_retries(3)
//!                 .initial_delay(Duration::from_millis(10))
//!                 .build()
//!                 .unwrap(),
//!         )
//!         .build()
//!         .unwrap();
//!
//!     let result = stack
//!         .execute_admitted(&limiter, "user:42", &profiles["api"], || async {
//!             Ok::<_, AppError>("fetched")
//!         })
//!         .await;
//!     assert_eq!(result.unwrap(), "fetched");
//! }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod classify;
pub mod clock;
pub mod config;
pub mod dynamic;
pub mod envelope;
pub mod error;
pub mod jitter;
pub mod prelude;
pub mod presets;
pub mod quota;
pub mod rate_limit;
pub mod retry;
pub mod sleeper;
pub mod stack;
pub mod telemetry;

// Re-exports
pub use backoff::{Backoff, BackoffError};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use circuit_breaker_registry::{
    BreakerSnapshot, CircuitBreakerRegistry, CircuitBreakerRegistryError,
};
pub use classify::{
    classify, Classifier, Classify, ErrorClassification, ErrorKind, HttpStatus, TextRule,
};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::{ConfigError, ResilienceConfig};
pub use dynamic::DynamicConfig;
pub use envelope::{EnvelopeOptions, ErrorEnvelope, SuccessEnvelope};
pub use error::{AppError, RateLimitError, ResilienceError};
pub use jitter::Jitter;
pub use quota::{AdaptiveQuota, QuotaError, QuotaParseError, QuotaRegistry, QuotaStatus};
pub use rate_limit::{
    client_identifier, BucketStore, InMemoryBucketStore, ProfileTable, RateLimitDecision,
    RateLimitLayer, RateLimitProfile, RateLimiter,
};
pub use retry::{BatchOutcome, BuildError, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use stack::{ResilienceStack, ResilienceStackBuilder};
pub use telemetry::{MemorySink, PolicyEvent, Telemetry};
