//! Retry engine for fallible async operations.
//!
//! Semantics:
//! - The attempt counter starts at 1. After a failure, the error is returned as is when
//!   `attempt > max_retries` or when `should_retry(error, attempt)` says no; otherwise the engine
//!   sleeps for `compute_delay(error, attempt)` and invokes the operation again.
//! - Success on any attempt returns immediately, without a further delay.
//! - The caller always gets the last real error, never a synthetic "retries exhausted" wrapper.
//! - By default `should_retry` follows the classifier's `retryable` flag, and `compute_delay`
//!   prefers a rate-limit hint (the error's own `retry_after`, then the attached
//!   [`AdaptiveQuota`]'s wait estimate) over exponential backoff with jitter. Every delay is
//!   capped at `max_delay`.
//! - [`RetryPolicyBuilder::remote_procedure`] never retries validation, permission, auth, session
//!   and not-found failures, nor protocol errors the remote flagged as non-retryable.
//!
//! Invariants:
//! - The operation is invoked at most `max_retries + 1` times.
//! - Sleeps happen only between attempts, through the injected [`Sleeper`].
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use backstop::{AppError, InstantSleeper, RetryPolicy};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::<AppError>::builder()
//!     .max_retries(2)
//!     .initial_delay(Duration::from_millis(100))
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//! let result: Result<(), AppError> =
//!     policy.execute(|| async { Err(AppError::network("connection reset")) }).await;
//! assert_eq!(result.unwrap_err().message(), "connection reset");
//! # });
//! ```

use crate::backoff::{Backoff, BackoffError};
use crate::classify::{Classifier, Classify, ErrorClassification, ErrorKind};
use crate::jitter::Jitter;
use crate::quota::AdaptiveQuota;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{PolicyEvent, RetryEvent, Telemetry};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound accepted for `max_retries`.
pub const MAX_RETRIES_LIMIT: usize = 100;

/// Pluggable retry predicate: `(error, attempt) -> retry?`.
pub type ShouldRetryFn<E> = Arc<dyn Fn(&E, usize) -> bool + Send + Sync>;

/// Pluggable delay computation: `(error, attempt) -> delay`.
pub type ComputeDelayFn<E> = Arc<dyn Fn(&E, usize) -> Duration + Send + Sync>;

/// Errors produced while building a retry policy.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error("max_retries must be <= {MAX_RETRIES_LIMIT} (got {0})")]
    TooManyRetries(usize),
    #[error("invalid backoff: {0}")]
    Backoff(#[from] BackoffError),
}

enum RetryPredicate<E> {
    Classified,
    RemoteProcedure,
    Custom(ShouldRetryFn<E>),
}

impl<E> Clone for RetryPredicate<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Classified => Self::Classified,
            Self::RemoteProcedure => Self::RemoteProcedure,
            Self::Custom(f) => Self::Custom(f.clone()),
        }
    }
}

/// Retry decision used for structured remote-procedure failures.
///
/// Deterministically wrong requests are never retried, whatever the kind's default says.
pub fn rpc_should_retry(classification: &ErrorClassification) -> bool {
    match classification.kind {
        ErrorKind::Validation
        | ErrorKind::PermissionDenied
        | ErrorKind::AuthFailed
        | ErrorKind::SessionExpired
        | ErrorKind::ResourceNotFound => false,
        _ => classification.retryable,
    }
}

/// Retry policy: attempt budget, backoff, jitter, predicate, delay hints and sleeper.
///
/// Immutable once built; every `execute` call keeps its own attempt counter.
pub struct RetryPolicy<E> {
    max_retries: usize,
    backoff: Backoff,
    max_delay: Duration,
    jitter: Jitter,
    should_retry: RetryPredicate<E>,
    compute_delay: Option<ComputeDelayFn<E>>,
    classifier: Arc<Classifier>,
    quota: Option<AdaptiveQuota>,
    sleeper: Arc<dyn Sleeper>,
    telemetry: Telemetry,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_retries: self.max_retries,
            backoff: self.backoff.clone(),
            max_delay: self.max_delay,
            jitter: self.jitter,
            should_retry: self.should_retry.clone(),
            compute_delay: self.compute_delay.clone(),
            classifier: self.classifier.clone(),
            quota: self.quota.clone(),
            sleeper: self.sleeper.clone(),
            telemetry: self.telemetry.clone(),
        }
    }
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let predicate = match self.should_retry {
            RetryPredicate::Classified => "classified",
            RetryPredicate::RemoteProcedure => "remote_procedure",
            RetryPredicate::Custom(_) => "<predicate>",
        };
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("should_retry", &predicate)
            .field("compute_delay", &self.compute_delay.as_ref().map(|_| "<delay fn>"))
            .field("quota", &self.quota.is_some())
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

/// Per-operation results of [`RetryPolicy::execute_batch`], in input order.
#[derive(Debug)]
pub struct BatchOutcome<T, E> {
    pub results: Vec<Result<T, E>>,
}

impl<T, E> BatchOutcome<T, E> {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(Result::is_ok)
    }

    pub fn successes(&self) -> impl Iterator<Item = &T> {
        self.results.iter().filter_map(|r| r.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &E> {
        self.results.iter().filter_map(|r| r.as_ref().err())
    }
}

impl<E> RetryPolicy<E>
where
    E: Classify + Send + Sync + 'static,
{
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Execute an async operation with retry semantics.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
    {
        let mut attempt = 1;
        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let classification = self.classifier.classify(&error);
            if attempt > self.max_retries || !self.should_retry(&error, &classification, attempt) {
                if attempt > self.max_retries && classification.retryable {
                    tracing::warn!(attempts = attempt, kind = %classification.kind, "retries exhausted");
                } else {
                    tracing::debug!(attempt, kind = %classification.kind, "error is not retryable");
                }
                self.telemetry
                    .emit(PolicyEvent::Retry(RetryEvent::GaveUp {
                        attempts: attempt,
                        kind: classification.kind,
                    }))
                    .await;
                return Err(error);
            }

            let delay = self.compute_delay(&error, &classification, attempt);
            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                kind = %classification.kind,
                "retrying after failure"
            );
            self.telemetry.emit(PolicyEvent::Retry(RetryEvent::Attempt { attempt, delay })).await;
            self.sleeper.sleep(delay).await;
            attempt += 1;
        }
    }

    /// Run independent operations through this policy concurrently.
    ///
    /// A failing operation never aborts the others; results come back in input order.
    pub async fn execute_batch<T, Fut, Op>(&self, operations: Vec<Op>) -> BatchOutcome<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
    {
        let results = join_all(operations.into_iter().map(|op| self.execute(op))).await;
        let outcome = BatchOutcome { results };
        tracing::debug!(
            succeeded = outcome.succeeded(),
            failed = outcome.failed(),
            "batch finished"
        );
        outcome
    }

    fn should_retry(&self, error: &E, classification: &ErrorClassification, attempt: usize) -> bool {
        match &self.should_retry {
            RetryPredicate::Classified => classification.retryable,
            RetryPredicate::RemoteProcedure => rpc_should_retry(classification),
            RetryPredicate::Custom(f) => f(error, attempt),
        }
    }

    fn compute_delay(
        &self,
        error: &E,
        classification: &ErrorClassification,
        attempt: usize,
    ) -> Duration {
        if let Some(f) = &self.compute_delay {
            return f(error, attempt).min(self.max_delay);
        }
        if let Some(hint) = self.rate_limit_hint(classification) {
            return hint.min(self.max_delay);
        }
        self.jitter.apply(self.backoff.delay(attempt)).min(self.max_delay)
    }

    fn rate_limit_hint(&self, classification: &ErrorClassification) -> Option<Duration> {
        if classification.kind != ErrorKind::RateLimit {
            return None;
        }
        classification.retry_after().or_else(|| {
            self.quota.as_ref().map(|q| q.wait_hint(1.0)).filter(|wait| !wait.is_zero())
        })
    }
}

/// Builder for `RetryPolicy`.
pub struct RetryPolicyBuilder<E> {
    max_retries: usize,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
    jitter: Jitter,
    should_retry: RetryPredicate<E>,
    compute_delay: Option<ComputeDelayFn<E>>,
    classifier: Arc<Classifier>,
    quota: Option<AdaptiveQuota>,
    sleeper: Arc<dyn Sleeper>,
    telemetry: Telemetry,
}

impl<E> RetryPolicyBuilder<E>
where
    E: Classify + Send + Sync + 'static,
{
    /// Defaults: 3 retries, 1 s initial delay doubling up to 30 s, 10% jitter, classifier-driven.
    pub fn new() -> Self {
        Self {
            max_retries: crate::presets::DEFAULT_MAX_RETRIES,
            initial_delay: crate::presets::DEFAULT_INITIAL_DELAY,
            max_delay: crate::presets::DEFAULT_MAX_DELAY,
            backoff_multiplier: crate::presets::DEFAULT_BACKOFF_MULTIPLIER,
            jitter: Jitter::default(),
            should_retry: RetryPredicate::Classified,
            compute_delay: None,
            classifier: Arc::new(Classifier::default()),
            quota: None,
            sleeper: Arc::new(TokioSleeper),
            telemetry: Telemetry::null(),
        }
    }

    /// Builder for structured remote-procedure calls (GraphQL and the like).
    pub fn remote_procedure() -> Self {
        let mut builder = Self::new();
        builder.should_retry = RetryPredicate::RemoteProcedure;
        builder
    }

    /// Retries after the first attempt. `0` disables retrying.
    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Cap for every computed delay, hints included.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Toggle the default 10% additive jitter.
    pub fn use_jitter(mut self, enabled: bool) -> Self {
        self.jitter = if enabled { Jitter::default() } else { Jitter::None };
        self
    }

    /// Set jitter strategy.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the retry predicate. Receives the error and the attempt that produced it.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E, usize) -> bool + Send + Sync + 'static,
    {
        self.should_retry = RetryPredicate::Custom(Arc::new(predicate));
        self
    }

    /// Replace the delay computation. The result is still capped at `max_delay`.
    pub fn compute_delay<F>(mut self, compute: F) -> Self
    where
        F: Fn(&E, usize) -> Duration + Send + Sync + 'static,
    {
        self.compute_delay = Some(Arc::new(compute));
        self
    }

    /// Classifier used by the default predicate and delay computation.
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Consult `quota` for a wait hint when a rate-limit error carries none.
    pub fn with_quota(mut self, quota: AdaptiveQuota) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Build the retry policy, validating inputs.
    pub fn build(self) -> Result<RetryPolicy<E>, BuildError> {
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(BuildError::TooManyRetries(self.max_retries));
        }
        let backoff = Backoff::exponential(self.initial_delay)
            .with_multiplier(self.backoff_multiplier)?
            .with_max(self.max_delay)?;
        Ok(RetryPolicy {
            max_retries: self.max_retries,
            backoff,
            max_delay: self.max_delay,
            jitter: self.jitter,
            should_retry: self.should_retry,
            compute_delay: self.compute_delay,
            classifier: self.classifier,
            quota: self.quota,
            sleeper: self.sleeper,
            telemetry: self.telemetry,
        })
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: Classify + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::AppError;
    use crate::sleeper::{InstantSleeper, TrackingSleeper};
    use crate::telemetry::MemorySink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy(max_retries: usize) -> RetryPolicyBuilder<AppError> {
        RetryPolicy::builder()
            .max_retries(max_retries)
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(5))
            .use_jitter(false)
    }

    #[tokio::test]
    async fn success_first_attempt() {
        let sleeper = TrackingSleeper::new();
        let policy = policy(3).with_sleeper(sleeper.clone()).build().unwrap();
        let counter = AtomicUsize::new(0);

        let result = policy
            .execute(|| async {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AppError>(42)
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1, "Should only execute once");
        assert!(sleeper.calls().is_empty());
    }

    #[tokio::test]
    async fn success_after_retries() {
        let sleeper = TrackingSleeper::new();
        let policy = policy(5).with_sleeper(sleeper.clone()).build().unwrap();
        let counter = AtomicUsize::new(0);

        let result = policy
            .execute(|| async {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(AppError::network(format!("ECONNRESET on attempt {attempt}")))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3, "Should succeed on 3rd attempt");
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(100), Duration::from_millis(200)]);
    }

    #[tokio::test]
    async fn exhaustion_returns_the_last_real_error() {
        let policy = policy(3).with_sleeper(InstantSleeper).build().unwrap();
        let counter = AtomicUsize::new(0);

        let err = policy
            .execute(|| async {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AppError::network(format!("timeout #{n}")))
            })
            .await
            .unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(err.message(), "timeout #3");
    }

    #[tokio::test]
    async fn zero_retries_runs_once() {
        let policy = policy(0).with_sleeper(InstantSleeper).build().unwrap();
        let counter = AtomicUsize::new(0);
        let _ = policy
            .execute(|| async {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AppError::network("down"))
            })
            .await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_retryable_errors_return_immediately() {
        let policy = policy(5).with_sleeper(InstantSleeper).build().unwrap();
        let counter = AtomicUsize::new(0);

        let err = policy
            .execute(|| async {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AppError::validation("email is required"))
            })
            .await
            .unwrap_err();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn opaque_errors_are_classified_from_text() {
        let policy = RetryPolicy::<String>::builder()
            .max_retries(2)
            .with_sleeper(InstantSleeper)
            .build()
            .unwrap();
        let counter = AtomicUsize::new(0);

        let _ = policy
            .execute(|| async {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("Request failed: 429 rate limit exceeded".to_string())
            })
            .await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        counter.store(0, Ordering::SeqCst);
        let _ = policy
            .execute(|| async {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("mystery failure".to_string())
            })
            .await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limit_hint_wins_over_backoff_and_is_capped() {
        let sleeper = TrackingSleeper::new();
        let policy = policy(2).with_sleeper(sleeper.clone()).build().unwrap();
        let counter = AtomicUsize::new(0);

        let _ = policy
            .execute(|| async {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let wait = if n == 0 { 2 } else { 60 };
                Err::<(), _>(AppError::rate_limited("throttled", Some(Duration::from_secs(wait))))
            })
            .await;

        assert_eq!(sleeper.calls(), vec![Duration::from_secs(2), Duration::from_secs(5)]);
    }

    #[tokio::test]
    async fn quota_hint_is_used_when_the_error_has_none() {
        let clock = ManualClock::starting_at(0);
        let quota = AdaptiveQuota::default().with_clock(clock.clone());
        quota.update_from_header("40/40").unwrap();

        let sleeper = TrackingSleeper::new();
        let policy =
            policy(1).with_quota(quota).with_sleeper(sleeper.clone()).build().unwrap();

        let _ = policy
            .execute(|| async { Err::<(), _>(AppError::rate_limited("Throttled", None)) })
            .await;

        assert_eq!(sleeper.calls(), vec![Duration::from_millis(500)]);
    }

    #[tokio::test]
    async fn remote_procedure_never_retries_deterministic_failures() {
        let policy = RetryPolicyBuilder::<AppError>::remote_procedure()
            .max_retries(3)
            .with_sleeper(InstantSleeper)
            .build()
            .unwrap();

        for err in [
            AppError::validation("Field 'title' is invalid"),
            AppError::permission_denied("Access denied for products field"),
            AppError::not_found("Product not found"),
            AppError::auth_failed("Invalid API key"),
            AppError::session_expired("Session expired"),
            AppError::remote_protocol("Field 'x' doesn't exist on type 'Shop'", false),
        ] {
            let counter = AtomicUsize::new(0);
            let _ = policy
                .execute(|| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let err = err.clone();
                    async move { Err::<(), _>(err) }
                })
                .await;
            assert_eq!(counter.load(Ordering::SeqCst), 1, "{err} must not be retried");
        }

        let counter = AtomicUsize::new(0);
        let _ = policy
            .execute(|| async {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AppError::remote_protocol("THROTTLED", true))
            })
            .await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn custom_predicate_and_delay() {
        let sleeper = TrackingSleeper::new();
        let policy = policy(5)
            .should_retry(|_e: &AppError, attempt| attempt < 3)
            .compute_delay(|_e, attempt| Duration::from_millis(attempt as u64 * 7))
            .with_sleeper(sleeper.clone())
            .build()
            .unwrap();
        let counter = AtomicUsize::new(0);

        let _ = policy
            .execute(|| async {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AppError::validation("would not normally retry"))
            })
            .await;

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(7), Duration::from_millis(14)]);
    }

    #[tokio::test]
    async fn batch_collects_every_outcome() {
        let policy = policy(1).with_sleeper(InstantSleeper).build().unwrap();
        let ops: Vec<_> = (0..4u32)
            .map(|n| {
                move || async move {
                    if n % 2 == 0 {
                        Ok(n)
                    } else {
                        Err(AppError::not_found(format!("item {n}")))
                    }
                }
            })
            .collect();

        let outcome = policy.execute_batch(ops).await;

        assert_eq!(outcome.succeeded(), 2);
        assert_eq!(outcome.failed(), 2);
        assert!(!outcome.all_succeeded());
        assert_eq!(outcome.successes().copied().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(outcome.failures().map(|e| e.message()).collect::<Vec<_>>(), ["item 1", "item 3"]);
    }

    #[tokio::test]
    async fn telemetry_reports_attempts_and_give_up() {
        let sink = MemorySink::new();
        let policy = policy(1)
            .with_sleeper(InstantSleeper)
            .with_telemetry(Telemetry::new(sink.clone()))
            .build()
            .unwrap();

        let _ = policy.execute(|| async { Err::<(), _>(AppError::network("reset")) }).await;

        assert_eq!(
            sink.events(),
            vec![
                PolicyEvent::Retry(RetryEvent::Attempt {
                    attempt: 1,
                    delay: Duration::from_millis(100)
                }),
                PolicyEvent::Retry(RetryEvent::GaveUp { attempts: 2, kind: ErrorKind::Network }),
            ]
        );
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        assert!(matches!(policy(1000).build(), Err(BuildError::TooManyRetries(1000))));
        assert!(matches!(
            policy(1).initial_delay(Duration::from_secs(10)).max_delay(Duration::from_secs(1)).build(),
            Err(BuildError::Backoff(BackoffError::MaxLessThanBase { .. }))
        ));
        assert!(matches!(
            policy(1).backoff_multiplier(0.5).build(),
            Err(BuildError::Backoff(BackoffError::InvalidMultiplier(_)))
        ));
    }
}
