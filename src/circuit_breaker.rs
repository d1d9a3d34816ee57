//! Circuit breaker implementation with lock-free atomics
//!
//! Semantics:
//! - **Closed**: calls pass through. `threshold` consecutive failures open the circuit; any
//!   success resets the streak.
//! - **Open**: calls are rejected with [`ResilienceError::CircuitOpen`] without running the
//!   operation until `cooldown` has elapsed since the most recent failure.
//! - **HalfOpen**: exactly one trial call is admitted once the cooldown has elapsed. Concurrent
//!   callers are rejected while it runs, with `retry_in` of at least [`TRIAL_RETRY_ESTIMATE`].
//!   A successful trial closes the circuit and clears the failure count; a failed trial reopens
//!   it and restarts the cooldown.
//!
//! Clones share state, so every handle observes the same lifecycle.

use crate::clock::{Clock, MonotonicClock};
use crate::error::ResilienceError;
use crate::telemetry::{CircuitBreakerEvent, PolicyEvent, Telemetry};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Reported to callers rejected while a half-open trial is still running.
pub const TRIAL_RETRY_ESTIMATE: Duration = Duration::from_secs(1);

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the cooldown elapses.
    Open,
    /// A single trial call is testing recovery.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("threshold must be > 0 (got {provided})")]
    InvalidThreshold { provided: usize },
    #[error("cooldown must be > 0 unless breaker is disabled (got {0:?})")]
    InvalidCooldown(Duration),
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    threshold: usize,
    cooldown: Duration,
}

impl CircuitBreakerConfig {
    /// Create a config with validation.
    pub fn new(threshold: usize, cooldown: Duration) -> Result<Self, CircuitBreakerError> {
        if threshold == 0 {
            return Err(CircuitBreakerError::InvalidThreshold { provided: threshold });
        }
        if cooldown.is_zero() {
            return Err(CircuitBreakerError::InvalidCooldown(cooldown));
        }
        Ok(Self { threshold, cooldown })
    }

    /// A breaker that never opens.
    pub fn disabled() -> Self {
        Self { threshold: usize::MAX, cooldown: Duration::MAX }
    }

    /// Consecutive failures before opening from Closed.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Time since the last failure before a trial call is admitted.
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

#[derive(Debug)]
struct BreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    last_failure_millis: AtomicU64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicUsize::new(0),
            last_failure_millis: AtomicU64::new(0),
        }
    }

    fn current(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        self.state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

enum Admission {
    Pass,
    Trial,
    Reject { retry_in: Duration },
}

/// Puts the circuit back to Open if a trial is dropped before it reports an outcome.
struct TrialGuard<'a> {
    state: &'a BreakerState,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.state.transition(CircuitState::HalfOpen, CircuitState::Open) {
            tracing::debug!("circuit breaker trial abandoned, back to open");
        }
    }
}

/// Circuit breaker guarding an async operation.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: Arc<BreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
}

impl CircuitBreaker {
    /// Create a circuit breaker, validating threshold and cooldown.
    ///
    /// # Examples
    /// ```
    /// use backstop::CircuitBreaker;
    /// use std::time::Duration;
    /// let breaker = CircuitBreaker::new(5, Duration::from_secs(60)).unwrap();
    /// ```
    pub fn new(threshold: usize, cooldown: Duration) -> Result<Self, CircuitBreakerError> {
        Ok(Self::with_config(CircuitBreakerConfig::new(threshold, cooldown)?))
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(BreakerState::new()),
            config,
            clock: Arc::new(MonotonicClock::default()),
            telemetry: Telemetry::null(),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub(crate) fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state.current()
    }

    /// Consecutive failures counted so far.
    pub fn failure_count(&self) -> usize {
        self.state.failure_count.load(Ordering::Acquire)
    }

    /// Force the circuit closed and clear the failure count.
    pub fn reset(&self) {
        self.state.failure_count.store(0, Ordering::Release);
        self.state.last_failure_millis.store(0, Ordering::Release);
        self.state.state.store(STATE_CLOSED, Ordering::Release);
        tracing::info!("Circuit breaker reset → closed");
    }

    /// Executes the provided async operation under circuit breaker protection.
    ///
    /// # Errors
    /// Returns `ResilienceError::CircuitOpen` when the call is rejected, and
    /// `ResilienceError::Inner(E)` with the operation's own error when it fails.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        let mut guard = match self.admit() {
            Admission::Pass => None,
            Admission::Trial => {
                tracing::info!("Circuit breaker → half-open");
                self.emit(CircuitBreakerEvent::HalfOpen).await;
                Some(TrialGuard { state: &self.state, armed: true })
            }
            Admission::Reject { retry_in } => {
                let failure_count = self.failure_count();
                tracing::debug!(
                    failure_count,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "Circuit breaker rejected call"
                );
                self.emit(CircuitBreakerEvent::Rejected { retry_in }).await;
                return Err(ResilienceError::CircuitOpen { failure_count, retry_in });
            }
        };

        let result = operation().await;
        let trial = match guard.as_mut() {
            Some(g) => {
                g.armed = false;
                true
            }
            None => false,
        };
        drop(guard);

        let event = match &result {
            Ok(_) => self.on_success(trial),
            Err(_) => self.on_failure(trial),
        };
        if let Some(event) = event {
            self.emit(event).await;
        }

        result.map_err(ResilienceError::Inner)
    }

    fn admit(&self) -> Admission {
        loop {
            match self.state.current() {
                CircuitState::Closed => return Admission::Pass,
                CircuitState::HalfOpen => {
                    return Admission::Reject {
                        retry_in: self.remaining_cooldown().max(TRIAL_RETRY_ESTIMATE),
                    }
                }
                CircuitState::Open => {
                    let remaining = self.remaining_cooldown();
                    if !remaining.is_zero() {
                        return Admission::Reject { retry_in: remaining };
                    }
                    if self.state.transition(CircuitState::Open, CircuitState::HalfOpen) {
                        return Admission::Trial;
                    }
                    // Lost the race; re-read the state.
                }
            }
        }
    }

    fn remaining_cooldown(&self) -> Duration {
        let last_failure = self.state.last_failure_millis.load(Ordering::Acquire);
        let elapsed = Duration::from_millis(self.clock.now_millis().saturating_sub(last_failure));
        self.config.cooldown.saturating_sub(elapsed)
    }

    fn on_success(&self, trial: bool) -> Option<CircuitBreakerEvent> {
        if trial {
            if self.state.transition(CircuitState::HalfOpen, CircuitState::Closed) {
                self.state.failure_count.store(0, Ordering::Release);
                tracing::info!("Circuit breaker → closed");
                return Some(CircuitBreakerEvent::Closed);
            }
            return None;
        }
        if self.state.current() == CircuitState::Closed {
            self.state.failure_count.store(0, Ordering::Release);
        }
        None
    }

    fn on_failure(&self, trial: bool) -> Option<CircuitBreakerEvent> {
        let failures = self.state.failure_count.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        self.state.last_failure_millis.store(self.clock.now_millis(), Ordering::Release);

        if trial {
            if self.state.transition(CircuitState::HalfOpen, CircuitState::Open) {
                tracing::warn!(failures, "Circuit breaker: trial failed → open");
                return Some(CircuitBreakerEvent::Opened { failure_count: failures });
            }
            return None;
        }

        if failures >= self.config.threshold
            && self.state.transition(CircuitState::Closed, CircuitState::Open)
        {
            tracing::error!(failures, threshold = self.config.threshold, "Circuit breaker → open");
            return Some(CircuitBreakerEvent::Opened { failure_count: failures });
        }
        None
    }

    async fn emit(&self, event: CircuitBreakerEvent) {
        self.telemetry.emit(PolicyEvent::CircuitBreaker(event)).await;
    }
}
