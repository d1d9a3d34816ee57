//! Error types shared across the resilience layer.
//!
//! - [`ResilienceError`] is what the composed policies return: either a policy rejected the
//!   call (rate limit, open circuit) or the wrapped operation failed with its own error.
//! - [`AppError`] is the structured application error. It carries its taxonomy kind from the
//!   moment it is constructed, so the classifier never has to guess.
//! - [`RateLimitError`] is the hard-stop denial raised by `RateLimiter::rate_limit`.

use crate::classify::ErrorKind;
use std::fmt;
use std::time::Duration;

/// Unified error type for composed policies.
#[derive(Debug, Clone, PartialEq)]
pub enum ResilienceError<E> {
    /// Admission was denied by a token bucket.
    RateLimited(RateLimitError),
    /// The circuit breaker is open; no call was attempted.
    CircuitOpen {
        /// Consecutive failures recorded when the call was rejected.
        failure_count: usize,
        /// Time left until the breaker admits a trial call.
        retry_in: Duration,
    },
    /// The underlying operation failed (after its own retries, if any).
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited(e) => write!(f, "{}", e),
            Self::CircuitOpen { retry_in, .. } => {
                write!(f, "circuit open, retry in {}s", ceil_secs(*retry_in))
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RateLimited(e) => Some(e),
            Self::CircuitOpen { .. } => None,
        }
    }
}

impl<E> From<RateLimitError> for ResilienceError<E> {
    fn from(err: RateLimitError) -> Self {
        Self::RateLimited(err)
    }
}

impl<E> ResilienceError<E> {
    /// Check if this error is due to rate limiting
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
    /// Check if this error is due to circuit breaker
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// How long the caller should wait before trying again, when a policy knows.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited(e) => Some(e.retry_after),
            Self::CircuitOpen { retry_in, .. } => Some(*retry_in),
            Self::Inner(_) => None,
        }
    }
}

/// Hard-stop denial from the token bucket limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitError {
    /// Human-readable message of the profile that denied the call.
    pub message: String,
    /// Time until at least one token accrues.
    pub retry_after: Duration,
    /// Bucket capacity.
    pub limit: u32,
    /// Whole tokens left (always 0 on denial, kept for header rendering).
    pub remaining: u32,
    /// Epoch milliseconds at which the bucket is full again.
    pub reset_at_ms: u64,
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (retry in {}s)", self.message, ceil_secs(self.retry_after))
    }
}

impl std::error::Error for RateLimitError {}

/// Structured application error carrying its taxonomy kind explicitly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct AppError {
    kind: ErrorKind,
    message: String,
    retry_after: Option<Duration>,
    retryable: Option<bool>,
    details: Option<String>,
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), retry_after: None, retryable: None, details: None }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self { retry_after, ..Self::new(ErrorKind::RateLimit, message) }
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthFailed, message)
    }

    pub fn session_expired(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SessionExpired, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceNotFound, message)
    }

    /// A protocol-level failure reported by a remote API (e.g. GraphQL `errors`).
    ///
    /// `retryable` is the remote service's own verdict and overrides the kind default.
    pub fn remote_protocol(message: impl Into<String>, retryable: bool) -> Self {
        Self { retryable: Some(retryable), ..Self::new(ErrorKind::RemoteProtocol, message) }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Attach technical details (stack, payload excerpt) for logs.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Override the kind's default retryability.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn retryable_override(&self) -> Option<bool> {
        self.retryable
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }
}

/// Whole seconds, rounded up, as used by `Retry-After` and user-facing wait estimates.
pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    millis.div_ceil(1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io;

    #[test]
    fn circuit_open_display_reports_seconds_left() {
        let err: ResilienceError<io::Error> = ResilienceError::CircuitOpen {
            failure_count: 3,
            retry_in: Duration::from_millis(29_100),
        };
        assert_eq!(err.to_string(), "circuit open, retry in 30s");
        assert_eq!(err.retry_after(), Some(Duration::from_millis(29_100)));
    }

    #[test]
    fn rate_limited_display_uses_profile_message() {
        let err = RateLimitError {
            message: "Too many login attempts".into(),
            retry_after: Duration::from_millis(1_500),
            limit: 5,
            remaining: 0,
            reset_at_ms: 0,
        };
        assert_eq!(err.to_string(), "Too many login attempts (retry in 2s)");
        let wrapped: ResilienceError<io::Error> = err.into();
        assert!(wrapped.is_rate_limited());
        assert!(wrapped.source().is_some());
    }

    #[test]
    fn inner_is_transparent() {
        let err = ResilienceError::Inner(AppError::network("socket closed"));
        assert_eq!(err.to_string(), "socket closed");
        assert!(err.is_inner());
        assert!(err.retry_after().is_none());
        assert_eq!(err.into_inner().map(|e| e.kind()), Some(ErrorKind::Network));
    }

    #[test]
    fn app_error_constructors_set_kind() {
        assert_eq!(AppError::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(AppError::not_found("x").kind(), ErrorKind::ResourceNotFound);
        let protocol = AppError::remote_protocol("THROTTLED", false);
        assert_eq!(protocol.retryable_override(), Some(false));
        let limited = AppError::rate_limited("slow down", Some(Duration::from_secs(2)));
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn ceil_secs_rounds_up() {
        assert_eq!(ceil_secs(Duration::ZERO), 0);
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
        assert_eq!(ceil_secs(Duration::from_millis(1000)), 1);
        assert_eq!(ceil_secs(Duration::from_millis(1001)), 2);
    }
}
