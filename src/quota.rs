//! Adaptive leaky bucket for a remote API that reports its own quota.
//!
//! Unlike the token bucket in [`crate::rate_limit`], an [`AdaptiveQuota`] is corrected by ground
//! truth: whenever the remote service reports `"<used>/<max>"`, the bucket is overwritten with
//! that observation. Between observations it simulates usage, restoring `restore_rate` calls per
//! second up to `max_calls`.
//!
//! Semantics:
//! - `wait_for_available_call(cost)` restores by elapsed time, consumes `cost` if available, and
//!   otherwise sleeps for the computed deficit and re-evaluates. Waiters re-check under the lock,
//!   so concurrent callers are never granted more than is available.
//! - After a wait the bucket is restored from the clock at the moment the wait completes; it is
//!   not reset to exactly `cost`.
//! - One instance per tenant. [`QuotaRegistry`] hands out per-tenant instances and never shares one
//!   across tenants.

use crate::clock::{Clock, MonotonicClock};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{PolicyEvent, QuotaEvent, Telemetry};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Default bucket size of a Shopify-style REST quota.
pub const DEFAULT_MAX_CALLS: f64 = 40.0;
/// Default restore rate, calls per second.
pub const DEFAULT_RESTORE_RATE: f64 = 2.0;

/// Malformed quota observation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuotaParseError {
    #[error("quota header {0:?} is not of the form <used>/<max>")]
    Malformed(String),
    #[error("quota header {0:?} contains a non-numeric or negative value")]
    InvalidNumber(String),
    #[error("quota header {0:?} reports a zero maximum")]
    ZeroMax(String),
}

/// Invalid quota configuration or request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QuotaError {
    #[error("max_calls must be a positive number (got {0})")]
    InvalidMaxCalls(f64),
    #[error("restore_rate must be a positive number (got {0})")]
    InvalidRestoreRate(f64),
    #[error("cost must be a positive number (got {0})")]
    InvalidCost(f64),
    #[error("cost {cost} exceeds the bucket size {max_calls}")]
    CostExceedsCapacity { cost: f64, max_calls: f64 },
}

/// Snapshot for observability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QuotaStatus {
    pub available: f64,
    pub max: f64,
    /// `available / max * 100`.
    pub percentage: f64,
}

#[derive(Debug, Clone, Copy)]
struct QuotaState {
    calls_available: f64,
    max_calls: f64,
    /// Calls per second.
    restore_rate: f64,
    last_check_ms: u64,
}

impl QuotaState {
    fn restore(&mut self, now_ms: u64) {
        let elapsed_secs = now_ms.saturating_sub(self.last_check_ms) as f64 / 1_000.0;
        self.calls_available =
            (self.calls_available + elapsed_secs * self.restore_rate).min(self.max_calls);
        self.last_check_ms = self.last_check_ms.max(now_ms);
    }

    /// Whole milliseconds, so a ms-resolution clock always moves far enough to cover the deficit.
    fn deficit_wait(&self, cost: f64) -> Duration {
        let missing = cost - self.calls_available;
        if missing <= 0.0 {
            return Duration::ZERO;
        }
        let millis = (missing * 1_000.0 / self.restore_rate).ceil().max(1.0);
        Duration::from_millis(millis.min(u64::MAX as f64) as u64)
    }
}

/// Per-tenant adaptive quota. Clones share the same bucket.
#[derive(Debug, Clone)]
pub struct AdaptiveQuota {
    state: Arc<Mutex<QuotaState>>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    telemetry: Telemetry,
}

impl Default for AdaptiveQuota {
    fn default() -> Self {
        Self::build(DEFAULT_MAX_CALLS, DEFAULT_RESTORE_RATE, Arc::new(MonotonicClock::default()))
    }
}

impl AdaptiveQuota {
    /// A full bucket of `max_calls`, restoring `restore_rate` calls per second.
    pub fn new(max_calls: f64, restore_rate: f64) -> Result<Self, QuotaError> {
        validate(max_calls, restore_rate)?;
        Ok(Self::build(max_calls, restore_rate, Arc::new(MonotonicClock::default())))
    }

    fn build(max_calls: f64, restore_rate: f64, clock: Arc<dyn Clock>) -> Self {
        let state = QuotaState {
            calls_available: max_calls,
            max_calls,
            restore_rate,
            last_check_ms: clock.now_millis(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            clock,
            sleeper: Arc::new(TokioSleeper),
            telemetry: Telemetry::null(),
        }
    }

    /// Override the clock (useful for deterministic tests). Restarts the restore timer.
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        self.with_shared_clock(Arc::new(clock))
    }

    fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.lock().last_check_ms = clock.now_millis();
        self.clock = clock;
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QuotaState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Last time the quota was resynced or consumed from.
    fn last_touched_ms(&self) -> u64 {
        self.lock().last_check_ms
    }

    /// Resynchronise with the remote service's own counters.
    ///
    /// `max_calls` becomes `max` and `calls_available` becomes `max - used` (never negative),
    /// regardless of what was simulated before. A non-positive `max` is ignored.
    pub fn update_from_observation(&self, used: f64, max: f64) {
        if !max.is_finite() || max <= 0.0 || !used.is_finite() {
            tracing::warn!(used, max, "ignoring invalid quota observation");
            return;
        }
        let now = self.clock.now_millis();
        let mut state = self.lock();
        state.max_calls = max;
        state.calls_available = (max - used).clamp(0.0, max);
        state.last_check_ms = state.last_check_ms.max(now);
        tracing::debug!(available = state.calls_available, max, "quota resynced from observation");
    }

    /// Parse `"<used>/<max>"` (e.g. `"38/40"`) and resynchronise.
    pub fn update_from_header(&self, header: &str) -> Result<(), QuotaParseError> {
        let (used, max) = parse_observation(header)?;
        self.update_from_observation(used, max);
        Ok(())
    }

    /// Wait until `cost` calls are available, then consume them.
    pub async fn wait_for_available_call(&self, cost: f64) -> Result<(), QuotaError> {
        if !cost.is_finite() || cost <= 0.0 {
            return Err(QuotaError::InvalidCost(cost));
        }
        loop {
            let wait = {
                let now = self.clock.now_millis();
                let mut state = self.lock();
                state.restore(now);
                if cost > state.max_calls {
                    return Err(QuotaError::CostExceedsCapacity { cost, max_calls: state.max_calls });
                }
                if state.calls_available >= cost {
                    state.calls_available -= cost;
                    return Ok(());
                }
                state.deficit_wait(cost)
            };

            tracing::debug!(cost, wait_ms = wait.as_millis() as u64, "waiting for quota to restore");
            self.telemetry.emit(PolicyEvent::Quota(QuotaEvent::Waiting { cost, wait })).await;
            self.sleeper.sleep(wait).await;
        }
    }

    /// How long a call of `cost` would have to wait right now. Does not consume.
    pub fn wait_hint(&self, cost: f64) -> Duration {
        let now = self.clock.now_millis();
        let mut projected = *self.lock();
        projected.restore(now);
        projected.deficit_wait(cost)
    }

    pub fn status(&self) -> QuotaStatus {
        let now = self.clock.now_millis();
        let mut projected = *self.lock();
        projected.restore(now);
        QuotaStatus {
            available: projected.calls_available,
            max: projected.max_calls,
            percentage: projected.calls_available * 100.0 / projected.max_calls,
        }
    }
}

fn evict_quotas(quotas: &DashMap<String, AdaptiveQuota>, clock: &dyn Clock, idle: Duration) -> usize {
    let idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX);
    let cutoff = clock.now_millis().saturating_sub(idle_ms);
    let before = quotas.len();
    quotas.retain(|_, quota| quota.last_touched_ms() >= cutoff);
    let evicted = before.saturating_sub(quotas.len());
    if evicted > 0 {
        tracing::debug!(evicted, "evicted idle quotas");
    }
    evicted
}

fn validate(max_calls: f64, restore_rate: f64) -> Result<(), QuotaError> {
    if !max_calls.is_finite() || max_calls <= 0.0 {
        return Err(QuotaError::InvalidMaxCalls(max_calls));
    }
    if !restore_rate.is_finite() || restore_rate <= 0.0 {
        return Err(QuotaError::InvalidRestoreRate(restore_rate));
    }
    Ok(())
}

fn parse_observation(header: &str) -> Result<(f64, f64), QuotaParseError> {
    let (used, max) =
        header.split_once('/').ok_or_else(|| QuotaParseError::Malformed(header.to_string()))?;
    let number = |s: &str| {
        s.trim()
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite() && *n >= 0.0)
            .ok_or_else(|| QuotaParseError::InvalidNumber(header.to_string()))
    };
    let (used, max) = (number(used)?, number(max)?);
    if max == 0.0 {
        return Err(QuotaParseError::ZeroMax(header.to_string()));
    }
    Ok((used, max))
}

/// Per-tenant quotas, created lazily with the registry's defaults.
///
/// Tenants stay in the map until [`QuotaRegistry::remove`] or an idle sweep
/// ([`QuotaRegistry::evict_idle`], [`QuotaRegistry::spawn_eviction`]) drops them.
#[derive(Debug, Clone)]
pub struct QuotaRegistry {
    quotas: Arc<DashMap<String, AdaptiveQuota>>,
    max_calls: f64,
    restore_rate: f64,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    telemetry: Telemetry,
}

impl Default for QuotaRegistry {
    fn default() -> Self {
        Self {
            quotas: Arc::default(),
            max_calls: DEFAULT_MAX_CALLS,
            restore_rate: DEFAULT_RESTORE_RATE,
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            telemetry: Telemetry::null(),
        }
    }
}

impl QuotaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults for quotas created from now on.
    pub fn with_defaults(mut self, max_calls: f64, restore_rate: f64) -> Result<Self, QuotaError> {
        validate(max_calls, restore_rate)?;
        self.max_calls = max_calls;
        self.restore_rate = restore_rate;
        Ok(self)
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// The quota for `tenant`, created full on first use.
    pub fn get(&self, tenant: &str) -> AdaptiveQuota {
        if let Some(existing) = self.quotas.get(tenant) {
            return existing.clone();
        }
        self.quotas
            .entry(tenant.to_string())
            .or_insert_with(|| {
                tracing::debug!(tenant, "creating adaptive quota");
                let quota = AdaptiveQuota::build(self.max_calls, self.restore_rate, self.clock.clone());
                AdaptiveQuota { sleeper: self.sleeper.clone(), telemetry: self.telemetry.clone(), ..quota }
            })
            .clone()
    }

    /// Drop a tenant's quota (e.g. when the account disconnects).
    pub fn remove(&self, tenant: &str) -> bool {
        self.quotas.remove(tenant).is_some()
    }

    /// Drop quotas not resynced or consumed from for `idle`. Returns how many were removed.
    ///
    /// An idle quota has restored to full, so only a resized `max_calls` is forgotten; the next
    /// observation learns it again. Handles already given out keep working on their own.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        evict_quotas(&self.quotas, &*self.clock, idle)
    }

    /// Run [`QuotaRegistry::evict_idle`] every `interval` on the tokio runtime.
    ///
    /// The task ends once every handle to this registry has been dropped.
    pub fn spawn_eviction(&self, interval: Duration, idle: Duration) -> JoinHandle<()> {
        let quotas: Weak<DashMap<String, AdaptiveQuota>> = Arc::downgrade(&self.quotas);
        let clock = self.clock.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(quotas) = quotas.upgrade() else {
                    tracing::debug!("quota registry dropped; stopping eviction sweep");
                    break;
                };
                evict_quotas(&quotas, &*clock, idle);
            }
        })
    }

    pub fn len(&self) -> usize {
        self.quotas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotas.is_empty()
    }

    /// Status of every known tenant, sorted by tenant.
    pub fn snapshot(&self) -> Vec<(String, QuotaStatus)> {
        let mut all: Vec<_> =
            self.quotas.iter().map(|e| (e.key().clone(), e.value().status())).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
