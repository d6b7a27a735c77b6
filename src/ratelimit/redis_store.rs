//! Redis-backed counter store.

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use std::time::Duration;
use tracing::{debug, warn};

use super::store::{CounterSnapshot, CounterStore};
use crate::config::StoreConfig;
use crate::error::StoreError;

/// Increment, set the expiry on the first hit (or if it was lost), and read
/// the remaining lifetime, all in one server-side step.
const HIT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if count == 1 or ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Bounds on a single Redis command and on (re)connecting.
///
/// A stalled server then fails commands instead of leaving them parked on
/// the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimeouts {
    pub response: Duration,
    pub connection: Duration,
}

impl ConnectionTimeouts {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            response: Duration::from_millis(config.response_timeout_ms),
            connection: Duration::from_millis(config.connect_timeout_ms),
        }
    }

    fn manager_config(&self) -> ConnectionManagerConfig {
        ConnectionManagerConfig::new()
            .set_response_timeout(self.response)
            .set_connection_timeout(self.connection)
    }
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

/// Counter store on a Redis server shared by every instance of the service.
pub struct RedisCounterStore {
    connection: ConnectionManager,
    hit_script: redis::Script,
    timeouts: ConnectionTimeouts,
}

impl RedisCounterStore {
    /// Connect to `url` and verify the server answers.
    pub async fn connect(url: &str, timeouts: ConnectionTimeouts) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| {
            warn!(error = %e, "Invalid Redis URL for counter store");
            StoreError::Unavailable(format!("invalid Redis URL: {e}"))
        })?;

        let connection = ConnectionManager::new_with_config(client, timeouts.manager_config())
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to connect to Redis counter store");
                StoreError::from(e)
            })?;

        let store = Self {
            connection,
            hit_script: redis::Script::new(HIT_SCRIPT),
            timeouts,
        };
        store.ping().await?;
        debug!("Connected to Redis counter store");
        Ok(store)
    }

    pub fn timeouts(&self) -> ConnectionTimeouts {
        self.timeouts
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply != "PONG" {
            return Err(StoreError::Protocol(format!("unexpected PING reply: {reply}")));
        }
        Ok(())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Interpret a `PTTL` reply: -2 for a missing key, -1 for no expiry.
fn ttl_from_reply(pttl: i64) -> Option<Duration> {
    u64::try_from(pttl).ok().map(Duration::from_millis)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let count: u64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.connection.clone();
        let pttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(ttl_from_reply(pttl))
    }

    async fn hit(&self, key: &str, window: Duration) -> Result<CounterSnapshot, StoreError> {
        let mut conn = self.connection.clone();
        let (count, pttl): (i64, i64) = self
            .hit_script
            .key(key)
            .arg(millis(window))
            .invoke_async(&mut conn)
            .await?;

        let count = u64::try_from(count)
            .map_err(|_| StoreError::Protocol(format!("negative counter value {count}")))?;
        Ok(CounterSnapshot {
            count,
            ttl: ttl_from_reply(pttl).unwrap_or(window),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_from_reply() {
        assert_eq!(ttl_from_reply(-2), None);
        assert_eq!(ttl_from_reply(-1), None);
        assert_eq!(ttl_from_reply(1500), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_millis_never_zero() {
        assert_eq!(millis(Duration::ZERO), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }

    #[test]
    fn test_timeouts_follow_store_config() {
        let config = StoreConfig {
            response_timeout_ms: 800,
            connect_timeout_ms: 3_000,
            ..StoreConfig::default()
        };

        let timeouts = ConnectionTimeouts::from_config(&config);
        assert_eq!(timeouts.response, Duration::from_millis(800));
        assert_eq!(timeouts.connection, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_invalid_url_is_unavailable() {
        let result = RedisCounterStore::connect("not a url", ConnectionTimeouts::default()).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    /// Runs against a live server when `BULWARK_TEST_REDIS_URL` is set.
    #[tokio::test]
    async fn test_hit_against_live_redis() {
        let Ok(url) = std::env::var("BULWARK_TEST_REDIS_URL") else {
            return;
        };
        let timeouts = ConnectionTimeouts {
            response: Duration::from_millis(750),
            connection: Duration::from_secs(1),
        };
        let store = RedisCounterStore::connect(&url, timeouts).await.unwrap();
        assert_eq!(store.timeouts(), timeouts);
        let key = format!("bulwark:test:{}", uuid::Uuid::new_v4());
        let window = Duration::from_secs(5);

        let first = store.hit(&key, window).await.unwrap();
        assert_eq!(first.count, 1);
        assert!(first.ttl <= window);

        let second = store.hit(&key, window).await.unwrap();
        assert_eq!(second.count, 2);

        let ttl = store.ttl(&key).await.unwrap();
        assert!(ttl.is_some());
    }
}
