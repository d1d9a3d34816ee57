//! Resilience stack builder for composing policies
//!
//! Order: admission (optional) → circuit breaker → retry → operation. The breaker sees one
//! outcome per `execute` call, so a breaker-level failure is only counted after the retry engine
//! has given up.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::classify::Classify;
use crate::error::ResilienceError;
use crate::rate_limit::{BucketStore, RateLimitProfile, RateLimiter};
use crate::retry::{BuildError, RetryPolicy};
use std::future::Future;

#[derive(Debug)]
pub struct ResilienceStack<E> {
    pub(crate) circuit_breaker: CircuitBreaker,
    pub(crate) retry: RetryPolicy<E>,
}

impl<E> Clone for ResilienceStack<E> {
    fn clone(&self) -> Self {
        Self { circuit_breaker: self.circuit_breaker.clone(), retry: self.retry.clone() }
    }
}

impl<E> ResilienceStack<E>
where
    E: Classify + Send + Sync + 'static,
{
    pub fn builder() -> ResilienceStackBuilder<E> {
        ResilienceStackBuilder::new()
    }

    /// Stack whose breaker is the one `registry` holds for `dependency`.
    pub fn for_dependency(
        registry: &CircuitBreakerRegistry,
        dependency: &str,
        retry: RetryPolicy<E>,
    ) -> Self {
        Self { circuit_breaker: registry.get(dependency), retry }
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    pub fn retry(&self) -> &RetryPolicy<E> {
        &self.retry
    }

    /// Run `operation` with retry, guarded by the circuit breaker.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
    {
        self.circuit_breaker.execute(|| self.retry.execute(operation)).await
    }

    /// Like [`execute`](Self::execute), after `limiter` has admitted `key` under `profile`.
    ///
    /// A denial fails with [`ResilienceError::RateLimited`] without touching the breaker.
    pub async fn execute_admitted<T, Fut, Op, S>(
        &self,
        limiter: &RateLimiter<S>,
        key: &str,
        profile: &RateLimitProfile,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
        S: BucketStore,
    {
        limiter.rate_limit(key, profile).await?;
        self.execute(operation).await
    }
}

pub struct ResilienceStackBuilder<E> {
    circuit_breaker: Option<CircuitBreaker>,
    retry: Option<RetryPolicy<E>>,
}

impl<E> ResilienceStackBuilder<E>
where
    E: Classify + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { circuit_breaker: None, retry: None }
    }

    pub fn circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    pub fn circuit_breaker_with_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(CircuitBreaker::with_config(config));
        self
    }

    pub fn no_circuit_breaker(mut self) -> Self {
        self.circuit_breaker = Some(CircuitBreaker::with_config(CircuitBreakerConfig::disabled()));
        self
    }

    pub fn retry(mut self, policy: RetryPolicy<E>) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Missing pieces fall back to the defaults in [`crate::presets`].
    pub fn build(self) -> Result<ResilienceStack<E>, BuildError> {
        let retry = match self.retry {
            Some(retry) => retry,
            None => RetryPolicy::builder().build()?,
        };
        Ok(ResilienceStack {
            circuit_breaker: self.circuit_breaker.unwrap_or_else(|| {
                CircuitBreaker::with_config(crate::presets::default_breaker_config())
            }),
            retry,
        })
    }
}

impl<E> Default for ResilienceStackBuilder<E>
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
    use crate::circuit_breaker::CircuitState;
    use crate::clock::ManualClock;
    use crate::error::AppError;
    use crate::sleeper::InstantSleeper;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn stack(threshold: usize, max_retries: usize) -> ResilienceStack<AppError> {
        let breaker = CircuitBreaker::new(threshold, Duration::from_secs(60))
            .unwrap()
            .with_clock(ManualClock::starting_at(0));
        let retry = RetryPolicy::builder()
            .max_retries(max_retries)
            .with_sleeper(InstantSleeper)
            .build()
            .unwrap();
        ResilienceStack::builder().circuit_breaker(breaker).retry(retry).build().unwrap()
    }

    #[tokio::test]
    async fn breaker_counts_one_failure_per_exhausted_retry_run() {
        let stack = stack(2, 3);
        let calls = AtomicUsize::new(0);

        let err = stack
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AppError::network("ECONNREFUSED"))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.as_inner().map(|e| e.message()), Some("ECONNREFUSED"));
        assert_eq!(stack.circuit_breaker().failure_count(), 1);
        assert_eq!(stack.circuit_breaker().state(), CircuitState::Closed);

        let _ = stack.execute(|| async { Err::<(), _>(AppError::network("ECONNREFUSED")) }).await;
        assert_eq!(stack.circuit_breaker().state(), CircuitState::Open);

        calls.store(0, Ordering::SeqCst);
        let err = stack
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AppError>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retry_recovers_inside_the_breaker() {
        let stack = stack(1, 2);
        let calls = AtomicUsize::new(0);

        let value = stack
            .execute(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(AppError::network("timeout"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(stack.circuit_breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn admission_denial_skips_the_operation() {
        let stack = stack(1, 0);
        let limiter = RateLimiter::new().with_clock(ManualClock::starting_at(0));
        let profile = RateLimitProfile::new(1, Duration::from_secs(60), "stack").unwrap();
        let calls = AtomicUsize::new(0);
        let op = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, AppError>("done")
        };

        assert_eq!(stack.execute_admitted(&limiter, "user:1", &profile, op).await.unwrap(), "done");
        let err = stack.execute_admitted(&limiter, "user:1", &profile, op).await.unwrap_err();

        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stack.circuit_breaker().failure_count(), 0);
    }

    #[tokio::test]
    async fn dependency_stacks_share_the_registry_breaker() {
        let registry =
            CircuitBreakerRegistry::new(CircuitBreakerConfig::new(1, Duration::from_secs(5)).unwrap());
        let retry = RetryPolicy::<AppError>::builder()
            .max_retries(0)
            .with_sleeper(InstantSleeper)
            .build()
            .unwrap();
        let a = ResilienceStack::for_dependency(&registry, "inventory", retry.clone());
        let b = ResilienceStack::for_dependency(&registry, "inventory", retry);

        let _ = a.execute(|| async { Err::<(), _>(AppError::internal("boom")) }).await;
        let err = b.execute(|| async { Ok::<_, AppError>(()) }).await.unwrap_err();
        assert!(err.is_circuit_open());
    }
}
