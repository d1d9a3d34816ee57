use backstop::{
    classify, AdaptiveQuota, AppError, CircuitBreaker, ErrorKind, InstantSleeper, ManualClock,
    RateLimitProfile, RateLimiter, ResilienceStack, RetryPolicy, TrackingSleeper,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn sixth_call_in_the_same_second_is_denied() {
    let limiter = RateLimiter::new().with_clock(ManualClock::starting_at(1_700_000_000_000));
    let profile = RateLimitProfile::new(5, Duration::from_millis(60_000), "api").unwrap();

    for n in 0..5 {
        let decision = limiter.check_rate_limit("ip:1.2.3.4", &profile).await;
        assert!(decision.allowed, "call {n} should be admitted");
        assert_eq!(decision.remaining, 4 - n);
    }

    let denied = limiter.check_rate_limit("ip:1.2.3.4", &profile).await;
    assert!(!denied.allowed);
    assert!(denied.retry_after.is_some_and(|wait| wait > Duration::ZERO));

    let err = limiter.rate_limit("ip:1.2.3.4", &profile).await.unwrap_err();
    assert_eq!(err.retry_after, Duration::from_millis(12_000));
}

#[tokio::test]
async fn observation_resyncs_the_adaptive_bucket() {
    let quota = AdaptiveQuota::new(40.0, 2.0).unwrap().with_clock(ManualClock::starting_at(0));
    quota.update_from_header("38/40").unwrap();

    let status = quota.status();
    assert_eq!(status.available, 2.0);
    assert_eq!(status.max, 40.0);
    assert_eq!(status.percentage, 5.0);
}

#[tokio::test]
async fn adaptive_bucket_waits_for_restored_calls() {
    let clock = ManualClock::starting_at(0);
    let sleeper = TrackingSleeper::driving(clock.clone());
    let quota = AdaptiveQuota::new(40.0, 2.0)
        .unwrap()
        .with_clock(clock.clone())
        .with_sleeper(sleeper.clone());
    quota.update_from_header("40/40").unwrap();

    quota.wait_for_available_call(3.0).await.unwrap();

    assert_eq!(sleeper.total(), Duration::from_millis(1_500));
    assert!(quota.status().available.abs() < 1e-9);
}

#[test]
fn raw_rate_limit_text_is_retryable() {
    let c = classify("Request failed: 429 rate limit exceeded");
    assert_eq!(c.kind, ErrorKind::RateLimit);
    assert!(c.retryable);
}

#[tokio::test]
async fn open_breaker_rejects_fourth_call_without_running_it() {
    let breaker = CircuitBreaker::new(3, Duration::from_secs(60))
        .unwrap()
        .with_clock(ManualClock::starting_at(0));
    for _ in 0..3 {
        let _ = breaker.execute(|| async { Err::<(), _>(AppError::network("ECONNREFUSED")) }).await;
    }

    let ran = AtomicUsize::new(0);
    let err = breaker
        .execute(|| async {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok::<_, AppError>(())
        })
        .await
        .unwrap_err();

    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert!(err.to_string().starts_with("circuit open, retry in "));
    assert!(err.to_string().ends_with('s'));
}

#[tokio::test]
async fn retry_budget_bounds_invocations() {
    for max_retries in [0usize, 1, 4] {
        let policy = RetryPolicy::builder()
            .max_retries(max_retries)
            .with_sleeper(InstantSleeper)
            .build()
            .unwrap();
        let calls = AtomicUsize::new(0);
        let _ = policy
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AppError::network("socket hang up"))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), max_retries + 1);
    }
}

#[tokio::test]
async fn throttled_remote_call_waits_for_the_quota() {
    let clock = ManualClock::starting_at(0);
    let sleeper = TrackingSleeper::driving(clock.clone());
    let quota = AdaptiveQuota::new(40.0, 2.0).unwrap().with_clock(clock.clone());
    let policy = backstop::presets::throttled_retry::<AppError>(quota.clone())
        .with_sleeper(sleeper.clone())
        .build()
        .unwrap();
    let stack = ResilienceStack::builder().retry(policy).build().unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let result = stack
        .execute(|| {
            let calls = calls.clone();
            let quota = quota.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    quota.update_from_header("40/40").unwrap();
                    Err(AppError::rate_limited("Throttled", None))
                } else {
                    Ok("products")
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "products");
    assert_eq!(sleeper.calls(), vec![Duration::from_millis(500)]);
}
