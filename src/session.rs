//! Session storage used by the session-loading stage and the login/logout routes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;

/// Name of the cookie carrying the session id.
pub const SESSION_COOKIE: &str = "sid";

const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// A logged-in session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id: impl Into<String>, email: impl Into<String>, ttl: Duration) -> Self {
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        Self {
            id: Uuid::new_v4().simple().to_string(),
            user_id: user_id.into(),
            email: email.into(),
            created_at,
            expires_at: created_at + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<Session>, StoreError>;

    async fn create(&self, user_id: &str, email: &str) -> Result<Session, StoreError>;

    async fn destroy(&self, id: &str) -> Result<(), StoreError>;
}

/// Sessions held in process memory. Expired sessions are never returned and
/// are dropped by [`InMemorySessionStore::spawn_sweeper`].
#[derive(Debug)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, Session>,
    ttl: Duration,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_SESSION_TTL)
    }
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    /// Drop every expired session. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired(now));
        before.saturating_sub(self.sessions.len())
    }

    /// Periodically purge expired sessions. The task ends once the store is dropped.
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
                    debug!(removed, remaining = store.len(), "Purged expired sessions");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let session = self.sessions.get(id).map(|s| s.clone());
        match session {
            Some(session) if session.is_expired(Utc::now()) => {
                self.sessions.remove(id);
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn create(&self, user_id: &str, email: &str) -> Result<Session, StoreError> {
        let session = Session::new(user_id, email, self.ttl);
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn destroy(&self, id: &str) -> Result<(), StoreError> {
        self.sessions.remove(id);
        Ok(())
    }
}

/// Find a cookie value in a `Cookie` header.
pub fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header
        .split(';')
        .map(str::trim)
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_session_lifecycle() {
        let store = InMemorySessionStore::new();

        let session = assert_ok!(store.create("u-1", "a@example.com").await);
        let loaded = assert_ok!(store.load(&session.id).await);
        assert_eq!(loaded, Some(session.clone()));

        assert_ok!(store.destroy(&session.id).await);
        assert_eq!(assert_ok!(store.load(&session.id).await), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_expired_sessions_are_not_loaded() {
        let store = InMemorySessionStore::with_ttl(Duration::ZERO);

        let session = assert_ok!(store.create("u-1", "a@example.com").await);
        assert_eq!(assert_ok!(store.load(&session.id).await), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let expiring = InMemorySessionStore::with_ttl(Duration::ZERO);
        for n in 0..3 {
            assert_ok!(expiring.create(&format!("u-{n}"), "a@example.com").await);
        }
        assert_eq!(expiring.purge_expired(), 3);
        assert!(expiring.is_empty());

        let lasting = InMemorySessionStore::new();
        assert_ok!(lasting.create("u-1", "a@example.com").await);
        assert_eq!(lasting.purge_expired(), 0);
        assert_eq!(lasting.len(), 1);
    }

    #[test]
    fn test_cookie_value() {
        let header = "theme=dark; sid=abc123; other=1";
        assert_eq!(cookie_value(header, "sid"), Some("abc123"));
        assert_eq!(cookie_value(header, "missing"), None);
        assert_eq!(cookie_value("sid=", "sid"), None);
    }
}
