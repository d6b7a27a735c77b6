//! Process-local counter store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

use super::clock::Clock;
use super::store::{CounterSnapshot, CounterStore};
use crate::error::StoreError;

/// A counter and the instant it stops being valid.
#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at: Option<Instant>,
}

impl CounterEntry {
    const fn fresh() -> Self {
        Self {
            count: 0,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }
}

/// In-memory counter store.
///
/// Each key lives in a `DashMap` shard, and every operation on a key runs
/// under that shard's lock, so increments for one key are serialized while
/// unrelated keys proceed in parallel. Expired counters are treated as absent
/// on access and dropped by [`InMemoryCounterStore::purge_expired`].
pub struct InMemoryCounterStore {
    counters: DashMap<String, CounterEntry>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
        }
    }

    /// Drop every expired counter. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.counters.len())
    }

    /// Number of counters currently held, expired or not.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Periodically purge expired counters. The task ends once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let removed = store.purge_expired();
                if removed > 0 {
                    debug!(removed, remaining = store.len(), "Purged expired counters");
                }
            }
        })
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(CounterEntry::fresh);
        if entry.is_expired(now) {
            *entry = CounterEntry::fresh();
        }
        entry.count += 1;
        Ok(entry.count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now();
        if let Some(mut entry) = self.counters.get_mut(key) {
            if !entry.is_expired(now) {
                entry.expires_at = Some(now + ttl);
            }
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = self.clock.now();
        Ok(self.counters.get(key).and_then(|entry| match entry.expires_at {
            Some(at) if at > now => Some(at - now),
            _ => None,
        }))
    }

    async fn hit(&self, key: &str, window: Duration) -> Result<CounterSnapshot, StoreError> {
        let now = self.clock.now();
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(CounterEntry::fresh);
        if entry.is_expired(now) {
            *entry = CounterEntry::fresh();
        }
        entry.count += 1;
        let expires_at = *entry.expires_at.get_or_insert(now + window);

        Ok(CounterSnapshot {
            count: entry.count,
            ttl: expires_at.saturating_duration_since(now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;

    fn store_with_clock() -> (Arc<InMemoryCounterStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(InMemoryCounterStore::new(clock.clone()));
        (store, clock)
    }

    #[tokio::test]
    async fn test_hit_counts_within_window() {
        let (store, clock) = store_with_clock();
        let window = Duration::from_millis(1000);

        for expected in 1..=3 {
            let snapshot = store.hit("A", window).await.unwrap();
            assert_eq!(snapshot.count, expected);
        }

        clock.advance(Duration::from_millis(400));
        let snapshot = store.hit("A", window).await.unwrap();
        assert_eq!(snapshot.count, 4);
        assert_eq!(snapshot.ttl, Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_hit_resets_after_expiry() {
        let (store, clock) = store_with_clock();
        let window = Duration::from_millis(1000);

        store.hit("A", window).await.unwrap();
        store.hit("A", window).await.unwrap();

        clock.advance(window);
        let snapshot = store.hit("A", window).await.unwrap();
        assert_eq!(snapshot.count, 1);
        assert_eq!(snapshot.ttl, window);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let (store, _clock) = store_with_clock();
        let window = Duration::from_secs(1);

        store.hit("A", window).await.unwrap();
        store.hit("A", window).await.unwrap();
        let b = store.hit("B", window).await.unwrap();

        assert_eq!(b.count, 1);
    }

    #[tokio::test]
    async fn test_primitives() {
        let (store, clock) = store_with_clock();

        assert_eq!(store.ttl("k").await.unwrap(), None);
        assert_eq!(store.incr("k").await.unwrap(), 1);
        assert_eq!(store.ttl("k").await.unwrap(), None);

        store.expire("k", Duration::from_secs(10)).await.unwrap();
        clock.advance(Duration::from_secs(4));
        assert_eq!(store.ttl("k").await.unwrap(), Some(Duration::from_secs(6)));
        assert_eq!(store.incr("k").await.unwrap(), 2);

        clock.advance(Duration::from_secs(6));
        assert_eq!(store.ttl("k").await.unwrap(), None);
        assert_eq!(store.incr("k").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expire_on_missing_key_is_noop() {
        let (store, _clock) = store_with_clock();
        store.expire("ghost", Duration::from_secs(1)).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store_with_clock();

        store.hit("short", Duration::from_secs(1)).await.unwrap();
        store.hit("long", Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.len(), 2);

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_hits_are_each_counted_once() {
        let (store, _clock) = store_with_clock();
        let window = Duration::from_secs(60);

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.hit("shared", window).await.unwrap().count })
            })
            .collect();

        let mut counts: Vec<u64> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        counts.sort_unstable();

        assert_eq!(counts, (1..=64).collect::<Vec<u64>>());
    }
}
