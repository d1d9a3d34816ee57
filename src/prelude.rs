//! Convenient re-exports for common backstop types.
pub use crate::{
    backoff::{Backoff, BackoffError, MAX_BACKOFF},
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState},
    circuit_breaker_registry::CircuitBreakerRegistry,
    classify::{classify, Classifier, Classify, ErrorClassification, ErrorKind},
    error::{AppError, RateLimitError, ResilienceError},
    jitter::Jitter,
    quota::{AdaptiveQuota, QuotaRegistry},
    rate_limit::{RateLimitProfile, RateLimiter},
    retry::{BuildError, RetryPolicy, RetryPolicyBuilder},
    stack::ResilienceStack,
    telemetry::{LogSink, MemorySink, NullSink, PolicyEvent, Telemetry},
};
