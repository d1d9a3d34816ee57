use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Persisted state of one token bucket.
///
/// `version` changes on every committed write and is never reused for a key, even after the
/// key is evicted and recreated; it is the compare-and-set token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub max_tokens: f64,
    /// Tokens accrued per millisecond.
    pub refill_rate: f64,
    pub last_refill_ms: u64,
    pub version: u64,
}

impl BucketState {
    /// A full bucket stamped at `now_ms`. Version 0 means "never stored".
    pub fn full(max_tokens: f64, refill_rate: f64, now_ms: u64) -> Self {
        Self { tokens: max_tokens, max_tokens, refill_rate, last_refill_ms: now_ms, version: 0 }
    }

    /// Accrue tokens for the time elapsed since the last refill, capped at `max_tokens`.
    ///
    /// A clock reading earlier than `last_refill_ms` accrues nothing and leaves the stamp alone.
    pub fn refilled(mut self, now_ms: u64) -> Self {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms) as f64;
        self.tokens = (self.tokens + elapsed * self.refill_rate).clamp(0.0, self.max_tokens);
        self.last_refill_ms = self.last_refill_ms.max(now_ms);
        self
    }
}

/// Storage backend for token buckets.
///
/// Implementations must make [`BucketStore::compare_and_set`] atomic per key: a write commits
/// only when the stored version still equals `expected_version` (0 = key absent). A committed
/// version must never repeat one previously handed out for the same key.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch the current state for a key.
    async fn load(&self, key: &str) -> Result<Option<BucketState>, Self::Error>;

    /// Commit `next` if the stored version equals `expected_version`.
    ///
    /// Returns `Ok(true)` if the write committed, `Ok(false)` on a conflict. On commit the stored
    /// version becomes `expected_version + 1` regardless of `next.version`.
    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: u64,
        next: BucketState,
    ) -> Result<bool, Self::Error>;

    /// Remove buckets whose `last_refill_ms` is older than `cutoff_ms`. Returns how many were
    /// removed.
    async fn evict_idle(&self, cutoff_ms: u64) -> Result<usize, Self::Error>;

    /// Number of buckets currently stored.
    async fn len(&self) -> Result<usize, Self::Error>;
}

/// In-memory bucket store backed by a sharded `DashMap`. Clones share the map.
///
/// Versions come from one store-wide counter, so a recreated bucket never matches a version
/// loaded before its eviction.
#[derive(Default, Clone, Debug)]
pub struct InMemoryBucketStore {
    data: Arc<DashMap<String, BucketState>>,
    versions: Arc<AtomicU64>,
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    type Error = std::convert::Infallible;

    async fn load(&self, key: &str) -> Result<Option<BucketState>, Self::Error> {
        Ok(self.data.get(key).map(|entry| *entry.value()))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: u64,
        next: BucketState,
    ) -> Result<bool, Self::Error> {
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                if slot.get().version != expected_version {
                    return Ok(false);
                }
                slot.insert(BucketState { version: self.next_version(), ..next });
                Ok(true)
            }
            Entry::Vacant(slot) => {
                if expected_version != 0 {
                    // Evicted between load and commit.
                    return Ok(false);
                }
                slot.insert(BucketState { version: self.next_version(), ..next });
                Ok(true)
            }
        }
    }

    async fn evict_idle(&self, cutoff_ms: u64) -> Result<usize, Self::Error> {
        let before = self.data.len();
        self.data.retain(|_, state| state.last_refill_ms >= cutoff_ms);
        Ok(before.saturating_sub(self.data.len()))
    }

    async fn len(&self) -> Result<usize, Self::Error> {
        Ok(self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refill_is_capped_and_monotonic() {
        let state = BucketState { tokens: 1.0, ..BucketState::full(5.0, 0.001, 1_000) };
        let later = state.refilled(3_000);
        assert_eq!(later.tokens, 3.0);
        assert_eq!(later.last_refill_ms, 3_000);
        assert_eq!(later.refilled(1_000_000).tokens, 5.0);

        let skewed = later.refilled(2_000);
        assert_eq!(skewed.tokens, 3.0);
        assert_eq!(skewed.last_refill_ms, 3_000);
    }

    #[tokio::test]
    async fn cas_rejects_stale_versions() {
        let store = InMemoryBucketStore::new();
        let state = BucketState::full(5.0, 0.001, 0);

        assert!(store.compare_and_set("k", 0, state).await.unwrap());
        assert!(!store.compare_and_set("k", 0, state).await.unwrap());

        let stored = store.load("k").await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert!(store.compare_and_set("k", 1, stored).await.unwrap());
        assert_eq!(store.load("k").await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn cas_after_eviction_conflicts() {
        let store = InMemoryBucketStore::new();
        assert!(store.compare_and_set("k", 0, BucketState::full(1.0, 1.0, 10)).await.unwrap());
        assert_eq!(store.evict_idle(11).await.unwrap(), 1);
        assert!(!store.compare_and_set("k", 1, BucketState::full(1.0, 1.0, 20)).await.unwrap());
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_write_after_evict_and_recreate_conflicts() {
        let store = InMemoryBucketStore::new();
        assert!(store.compare_and_set("k", 0, BucketState::full(5.0, 1.0, 10)).await.unwrap());
        let seen_before_eviction = store.load("k").await.unwrap().unwrap();

        assert_eq!(store.evict_idle(11).await.unwrap(), 1);
        let recreated = BucketState { tokens: 4.0, ..BucketState::full(5.0, 1.0, 20) };
        assert!(store.compare_and_set("k", 0, recreated).await.unwrap());

        let stale = BucketState { tokens: 4.0, ..seen_before_eviction };
        assert!(!store
            .compare_and_set("k", seen_before_eviction.version, stale)
            .await
            .unwrap());

        let stored = store.load("k").await.unwrap().unwrap();
        assert_ne!(stored.version, seen_before_eviction.version);
        assert_eq!(stored.last_refill_ms, 20);
    }

    #[tokio::test]
    async fn evict_idle_keeps_recent_buckets() {
        let store = InMemoryBucketStore::new();
        store.compare_and_set("old", 0, BucketState::full(1.0, 1.0, 100)).await.unwrap();
        store.compare_and_set("new", 0, BucketState::full(1.0, 1.0, 900)).await.unwrap();

        assert_eq!(store.evict_idle(500).await.unwrap(), 1);
        assert!(store.load("old").await.unwrap().is_none());
        assert!(store.load("new").await.unwrap().is_some());
    }
}
