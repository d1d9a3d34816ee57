//! Registry of named circuit breakers, one per downstream dependency.
//!
//! Breakers are created on first use with the registry's default config and shared afterwards,
//! so every caller talking to `"payments"` trips and heals the same circuit.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::clock::{Clock, MonotonicClock};
use crate::telemetry::Telemetry;
use tracing::warn;

/// Errors from breaker registries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerRegistryError {
    #[error("circuit breaker '{id}' not found")]
    NotFound { id: String },
}

/// Point-in-time view of one registered breaker.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub id: String,
    pub state: CircuitState,
    pub failure_count: usize,
}

/// In-memory registry backed by an RwLock. Clones share the same breakers.
#[derive(Clone, Debug)]
pub struct CircuitBreakerRegistry {
    inner: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
    defaults: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    telemetry: Telemetry,
}

impl CircuitBreakerRegistry {
    /// Registry creating breakers from `defaults`.
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            defaults,
            clock: Arc::new(MonotonicClock::default()),
            telemetry: Telemetry::null(),
        }
    }

    /// Clock handed to breakers created from now on.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// The breaker registered under `id`, creating it from the defaults if missing.
    pub fn get(&self, id: &str) -> CircuitBreaker {
        if let Some(existing) = self.lookup(id) {
            return existing;
        }
        let mut map = self.inner.write().expect("circuit breaker registry poisoned");
        map.entry(id.to_string())
            .or_insert_with(|| {
                tracing::debug!(id, "creating circuit breaker");
                CircuitBreaker::with_config(self.defaults.clone())
                    .with_shared_clock(self.clock.clone())
                    .with_telemetry(self.telemetry.clone())
            })
            .clone()
    }

    /// The breaker registered under `id`, if any. Never creates.
    pub fn lookup(&self, id: &str) -> Option<CircuitBreaker> {
        let guard = self.inner.read().expect("circuit breaker registry poisoned");
        guard.get(id).cloned()
    }

    /// Register a breaker under `id`, overwriting any existing one. Last registration wins.
    pub fn register(&self, id: impl Into<String>, breaker: CircuitBreaker) {
        let id = id.into();
        let mut map = self.inner.write().expect("circuit breaker registry poisoned");
        if map.contains_key(&id) {
            warn!(target: "backstop::circuit_breaker_registry", id = %id, "circuit breaker id replaced; last registration wins");
        }
        map.insert(id, breaker);
    }

    /// Reset a breaker by id, erroring if missing.
    pub fn reset(&self, id: &str) -> Result<(), CircuitBreakerRegistryError> {
        match self.lookup(id) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => Err(CircuitBreakerRegistryError::NotFound { id: id.to_string() }),
        }
    }

    pub fn reset_all(&self) {
        let map = self.inner.read().expect("circuit breaker registry poisoned");
        for breaker in map.values() {
            breaker.reset();
        }
    }

    /// Snapshot breaker states sorted by id.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let map = self.inner.read().expect("circuit breaker registry poisoned");
        let mut entries: Vec<BreakerSnapshot> = map
            .iter()
            .map(|(id, breaker)| BreakerSnapshot {
                id: id.clone(),
                state: breaker.state(),
                failure_count: breaker.failure_count(),
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("circuit breaker registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(crate::presets::default_breaker_config())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Mutex;
    use std::time::Duration;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut guard = self.0.lock().unwrap();
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn registry() -> CircuitBreakerRegistry {
        let config = CircuitBreakerConfig::new(1, Duration::from_secs(60)).unwrap();
        CircuitBreakerRegistry::new(config).with_clock(ManualClock::starting_at(0))
    }

    #[tokio::test]
    async fn get_or_create_shares_state_per_id() {
        let registry = registry();
        let payments = registry.get("payments");
        let _ = payments.execute(|| async { Err::<(), _>("down") }).await;

        assert_eq!(registry.get("payments").state(), CircuitState::Open);
        assert_eq!(registry.get("search").state(), CircuitState::Closed);
        assert_eq!(
            registry.snapshot(),
            vec![
                BreakerSnapshot {
                    id: "payments".into(),
                    state: CircuitState::Open,
                    failure_count: 1
                },
                BreakerSnapshot { id: "search".into(), state: CircuitState::Closed, failure_count: 0 },
            ]
        );
    }

    #[tokio::test]
    async fn reset_by_id() {
        let registry = registry();
        let _ = registry.get("payments").execute(|| async { Err::<(), _>("down") }).await;

        registry.reset("payments").unwrap();
        assert_eq!(registry.get("payments").state(), CircuitState::Closed);
        assert_eq!(
            registry.reset("missing"),
            Err(CircuitBreakerRegistryError::NotFound { id: "missing".into() })
        );
        assert!(registry.lookup("missing").is_none());
    }

    #[test]
    fn register_warns_and_replaces_duplicates() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = SharedWriter(buffer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(writer))
            .with_target(true)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let registry = registry();
        let first = CircuitBreaker::new(2, Duration::from_secs(1)).unwrap();
        registry.register("svc", first);
        let second = CircuitBreaker::new(9, Duration::from_secs(1)).unwrap();
        registry.register("svc", second);

        assert_eq!(registry.get("svc").config().threshold(), 9, "last registration should win");
        assert_eq!(registry.len(), 1);

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(
            logs.contains("circuit breaker id replaced"),
            "warning should be emitted on duplicate registration"
        );
    }
}
