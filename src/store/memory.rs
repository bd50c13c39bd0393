//! In-process key-value store with per-key expiry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{KeyValueStore, StoreError};

/// A stored value and the instant it stops being visible.
#[derive(Debug, Clone)]
struct Entry {
    value: String,
    /// `None` when the ttl reaches past what an `Instant` can represent
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: Instant::now().checked_add(ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

/// A [`KeyValueStore`] held in a sharded concurrent map.
///
/// Expired keys are invisible to readers immediately and are physically
/// removed lazily on access or by [`MemoryStore::purge_expired`].
/// Compare-and-set holds the shard lock for the key, so it is atomic with
/// respect to every other call on the same store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of `get` calls served.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Total number of successful writes.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Drop every expired key and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Periodically purge expired keys until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = store.len(), "Swept expired records");
                }
            }
        })
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();

        if let Some(entry) = self.entries.get(key) {
            if entry.is_live(now) {
                return Ok(Some(entry.value.clone()));
            }
        }

        // Evict lazily, but only if nobody refreshed the key in between.
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        trace!(key, ttl = ?ttl, "Storing value");
        self.entries.insert(key.to_string(), Entry::new(value, ttl));
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();

        let swapped = match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let current = occupied.get();
                let current = current.is_live(now).then_some(current.value.as_str());
                if current == expected {
                    occupied.insert(Entry::new(value, ttl));
                    true
                } else {
                    false
                }
            }
            MapEntry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(Entry::new(value, ttl));
                    true
                } else {
                    false
                }
            }
        };

        if swapped {
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        trace!(key, swapped, "Compare-and-set");
        Ok(swapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_get_missing_key() {
        let store = MemoryStore::new();
        assert_eq!(store.get("nope").await.unwrap(), None);
        assert_eq!(store.reads(), 1);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let store = MemoryStore::new();
        store.set("k", "v", TTL).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_values_expire() {
        let store = MemoryStore::new();
        store.set("k", "v", Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_ttl_never_expires() {
        let store = MemoryStore::new();
        store.set("a", "1", Duration::MAX).await.unwrap();
        assert!(store
            .compare_and_set("b", None, "2", Duration::from_secs(u64::MAX))
            .await
            .unwrap());

        tokio::time::advance(Duration::from_secs(365 * 24 * 60 * 60)).await;

        assert_eq!(store.purge_expired(), 0);
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_compare_and_set_on_absent_key() {
        let store = MemoryStore::new();

        assert!(store.compare_and_set("k", None, "a", TTL).await.unwrap());
        // Already present now, so "expect absent" must fail
        assert!(!store.compare_and_set("k", None, "b", TTL).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_compare_and_set_with_expected_value() {
        let store = MemoryStore::new();
        store.set("k", "a", TTL).await.unwrap();

        assert!(!store.compare_and_set("k", Some("stale"), "b", TTL).await.unwrap());
        assert!(store.compare_and_set("k", Some("a"), "b", TTL).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compare_and_set_treats_expired_as_absent() {
        let store = MemoryStore::new();
        store.set("k", "a", Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(!store.compare_and_set("k", Some("a"), "b", TTL).await.unwrap());
        assert!(store.compare_and_set("k", None, "c", TTL).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        store.set("short", "1", Duration::from_secs(1)).await.unwrap();
        store.set("long", "2", Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_in_background() {
        let store = Arc::new(MemoryStore::new());
        store.set("k", "v", Duration::from_secs(1)).await.unwrap();
        let handle = store.spawn_sweeper(Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(store.is_empty());

        drop(store);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(handle.is_finished());
    }
}
