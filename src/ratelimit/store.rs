//! Shared counter store abstraction.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::clock::SystemClock;
use super::memory::InMemoryCounterStore;
use super::redis_store::{ConnectionTimeouts, RedisCounterStore};
use crate::config::{StoreBackend, StoreConfig};
use crate::error::{Result, StoreError};

/// The state of a counter right after it was incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Requests seen in the current window, including this one
    pub count: u64,
    /// Time until the window resets
    pub ttl: Duration,
}

/// A key-value store with atomic increment and expiry.
///
/// Implementations must make `incr` atomic per key. `hit` combines the three
/// primitives into one round trip; stores that can do that atomically should
/// override it.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key`, creating it at 1 if absent. Returns the new count.
    async fn incr(&self, key: &str) -> std::result::Result<u64, StoreError>;

    /// Set or refresh the expiry of `key`. No-op when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> std::result::Result<(), StoreError>;

    /// Remaining lifetime of `key`, or `None` when it is absent or never expires.
    async fn ttl(&self, key: &str) -> std::result::Result<Option<Duration>, StoreError>;

    /// Count one request against `key` in a window of length `window`.
    async fn hit(
        &self,
        key: &str,
        window: Duration,
    ) -> std::result::Result<CounterSnapshot, StoreError> {
        let count = self.incr(key).await?;
        let ttl = match self.ttl(key).await? {
            Some(ttl) if count > 1 => ttl,
            // First hit of a window, or a counter that lost its expiry.
            _ => {
                self.expire(key, window).await?;
                window
            }
        };
        Ok(CounterSnapshot { count, ttl })
    }
}

/// Build the counter store selected by configuration.
pub async fn connect_store(config: &StoreConfig) -> Result<Arc<dyn CounterStore>> {
    match config.backend {
        StoreBackend::Memory => {
            let store = Arc::new(InMemoryCounterStore::new(Arc::new(SystemClock)));
            store.spawn_sweeper(Duration::from_millis(config.sweep_interval_ms.max(1)));
            info!("Using in-memory counter store");
            Ok(store)
        }
        StoreBackend::Redis => {
            let timeouts = ConnectionTimeouts::from_config(config);
            let store = RedisCounterStore::connect(&config.redis_url, timeouts).await?;
            info!(
                url = %config.redis_url,
                response_timeout_ms = config.response_timeout_ms,
                "Using Redis counter store"
            );
            Ok(Arc::new(store))
        }
    }
}
