//! Policy telemetry.
//!
//! Every policy in the crate reports what it did as a [`PolicyEvent`]. Events go to a sink, which
//! is any `tower::Service<PolicyEvent>`: the layer writes to it and never reads from it.
//!
//! # Event Types
//!
//! - **Rate limit**: `Denied`
//! - **Adaptive quota**: `Waiting`
//! - **Retry**: `Attempt`, `GaveUp`
//! - **Circuit Breaker**: `Opened`, `HalfOpen`, `Closed`, `Rejected`
//!
//! Emission is best effort: a sink that is not ready or fails drops the event, and the policy
//! carries on.
//!
//! ```rust
//! use backstop::telemetry::{PolicyEvent, RetryEvent};
//! use std::time::Duration;
//!
//! let event = PolicyEvent::Retry(RetryEvent::Attempt {
//!     attempt: 1,
//!     delay: Duration::from_millis(100),
//! });
//! assert_eq!(event.to_string(), "Retry::Attempt(#1, delay=100ms)");
//! ```

use crate::classify::ErrorKind;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::util::BoxCloneService;
use tower::{Service, ServiceExt};

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: PolicyEvent)
where
    S: Service<PolicyEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Policy events emitted during execution.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    RateLimit(RateLimitEvent),
    Quota(QuotaEvent),
    Retry(RetryEvent),
    CircuitBreaker(CircuitBreakerEvent),
}

/// Events emitted by the token bucket limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitEvent {
    /// An admission check was denied.
    Denied {
        /// Namespaced bucket key (`prefix:key`).
        key: String,
        retry_after: Duration,
    },
}

/// Events emitted by adaptive quotas.
#[derive(Debug, Clone, PartialEq)]
pub enum QuotaEvent {
    /// A caller is about to wait for calls to restore.
    Waiting { cost: f64, wait: Duration },
}

/// Events emitted by retry policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// A retry is about to be made after `delay`.
    Attempt {
        /// The attempt that just failed (1-indexed).
        attempt: usize,
        delay: Duration,
    },
    /// The last error is being returned to the caller.
    GaveUp {
        /// Total number of invocations made.
        attempts: usize,
        kind: ErrorKind,
    },
}

/// Events emitted by circuit breakers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    /// Circuit transitioned to open state.
    Opened {
        /// Number of consecutive failures that triggered the open
        failure_count: usize,
    },
    /// Circuit admitted its trial call.
    HalfOpen,
    /// Circuit transitioned to closed state.
    Closed,
    /// A call was rejected without being attempted.
    Rejected { retry_in: Duration },
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::RateLimit(event) => write!(f, "RateLimit::{}", event),
            PolicyEvent::Quota(event) => write!(f, "Quota::{}", event),
            PolicyEvent::Retry(event) => write!(f, "Retry::{}", event),
            PolicyEvent::CircuitBreaker(event) => write!(f, "CircuitBreaker::{}", event),
        }
    }
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitEvent::Denied { key, retry_after } => {
                write!(f, "Denied({}, retry_after={:?})", key, retry_after)
            }
        }
    }
}

impl fmt::Display for QuotaEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaEvent::Waiting { cost, wait } => {
                write!(f, "Waiting(cost={}, wait={:?})", cost, wait)
            }
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Attempt { attempt, delay } => {
                write!(f, "Attempt(#{}, delay={:?})", attempt, delay)
            }
            RetryEvent::GaveUp { attempts, kind } => {
                write!(f, "GaveUp(attempts={}, kind={})", attempts, kind)
            }
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { failure_count } => {
                write!(f, "Opened(failures={})", failure_count)
            }
            CircuitBreakerEvent::HalfOpen => write!(f, "HalfOpen"),
            CircuitBreakerEvent::Closed => write!(f, "Closed"),
            CircuitBreakerEvent::Rejected { retry_in } => {
                write!(f, "Rejected(retry_in={:?})", retry_in)
            }
        }
    }
}

type SinkFuture = Pin<Box<dyn Future<Output = Result<(), Infallible>> + Send>>;

/// Type-erased, shareable handle to a sink. Cloning shares the sink.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<Mutex<BoxCloneService<PolicyEvent, (), Infallible>>>,
}

impl Telemetry {
    pub fn new<S>(sink: S) -> Self
    where
        S: Service<PolicyEvent, Response = (), Error = Infallible> + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        Self { sink: Arc::new(Mutex::new(BoxCloneService::new(sink))) }
    }

    /// Handle that discards everything.
    pub fn null() -> Self {
        Self::new(NullSink)
    }

    /// Send `event` to the sink, best effort.
    pub async fn emit(&self, event: PolicyEvent) {
        let sink = {
            let guard = self.sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.clone()
        };
        emit_best_effort(sink, event).await;
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<PolicyEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: PolicyEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

/// A telemetry sink that logs events using the `tracing` crate at INFO level.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<PolicyEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        tracing::info!(event = %event, "policy_event");
        Box::pin(async { Ok(()) })
    }
}

/// A bounded, in-memory sink for tests and debugging.
///
/// Oldest events are evicted when capacity is exceeded.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<PolicyEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns a snapshot of all events received so far.
    pub fn events(&self) -> Vec<PolicyEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }

    /// Returns the number of evicted events.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<PolicyEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}
