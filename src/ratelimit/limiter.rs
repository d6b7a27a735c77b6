//! Core rate limiter implementation.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

use super::key::KeyExtractor;
use super::store::{CounterSnapshot, CounterStore};
use crate::config::LimiterConfig;
use crate::error::{Result, StoreError};
use crate::pipeline::RequestContext;

/// Key used when a request carries no identity at all.
const UNKNOWN_CLIENT: &str = "unknown";

/// Retry hint sent when a fail-closed limiter cannot reach its store.
const STORE_UNAVAILABLE_RETRY_AFTER: Duration = Duration::from_secs(1);

/// What a limiter does when its counter store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request.
    Open,
    /// Reject the request.
    Closed,
}

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    LimitExceeded,
    StoreUnavailable,
}

/// Counter state reported alongside a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Requests permitted per window
    pub limit: u64,
    /// Requests counted so far in this window, including this one
    pub count: u64,
    /// Requests left before rejection starts
    pub remaining: u64,
    /// Time until the window resets
    pub reset_after: Duration,
}

/// The outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Let the request through. `quota` is `None` when the store could not
    /// be consulted and the limiter failed open.
    Admit { quota: Option<Quota> },
    /// Stop the request.
    Reject {
        reason: RejectReason,
        retry_after: Duration,
        quota: Option<Quota>,
    },
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admit { .. })
    }

    pub fn quota(&self) -> Option<Quota> {
        match self {
            Decision::Admit { quota } | Decision::Reject { quota, .. } => *quota,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Decision::Admit { .. } => None,
            Decision::Reject { retry_after, .. } => Some(*retry_after),
        }
    }
}

/// A fixed-window limiter over a shared counter store.
///
/// Cloning the store handle is cheap and several limiters may share one
/// store; their key prefixes keep the counts apart.
pub struct RateLimiter {
    name: String,
    max: u64,
    window: Duration,
    key_prefix: String,
    key: Arc<dyn KeyExtractor>,
    failure_policy: FailurePolicy,
    store_timeout: Duration,
    store: Arc<dyn CounterStore>,
}

impl RateLimiter {
    /// Create a limiter from validated configuration.
    pub fn new(name: &str, config: &LimiterConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        config.validate(name)?;

        let failure_policy = match config.failure_policy {
            Some(policy) => policy,
            None => {
                warn!(
                    limiter = name,
                    "No failure_policy configured; failing open when the counter store is unavailable"
                );
                FailurePolicy::Open
            }
        };

        Ok(Self {
            name: name.to_string(),
            max: config.max,
            window: Duration::from_millis(config.window_ms),
            key_prefix: config.key_prefix.clone(),
            key: config.key.extractor()?,
            failure_policy,
            store_timeout: Duration::from_millis(config.store_timeout_ms),
            store,
        })
    }

    /// Replace the configured key strategy.
    pub fn with_key_extractor(mut self, key: Arc<dyn KeyExtractor>) -> Self {
        self.key = key;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// The namespaced store key a request is counted under.
    pub fn counter_key(&self, ctx: &RequestContext) -> String {
        let identity = self
            .key
            .extract(ctx)
            .or_else(|| ctx.client_addr.map(|addr| addr.to_string()))
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string());
        format!("{}{}", self.key_prefix, identity)
    }

    /// Count the request and decide whether to admit it.
    pub async fn check(&self, ctx: &RequestContext) -> Decision {
        let key = self.counter_key(ctx);
        self.check_key(key).await
    }

    /// Count one request against an already namespaced key.
    pub async fn check_key(&self, key: String) -> Decision {
        trace!(limiter = %self.name, key = %key, "Checking rate limit");

        match self.hit(&key).await {
            Ok(snapshot) => self.decide(&key, snapshot),
            Err(err) => self.on_store_error(&key, err),
        }
    }

    /// Run the store round trip on its own task, so the request is counted
    /// even if the caller goes away while it is in flight.
    async fn hit(&self, key: &str) -> std::result::Result<CounterSnapshot, StoreError> {
        let store = Arc::clone(&self.store);
        let owned_key = key.to_string();
        let window = self.window;
        let task = tokio::spawn(async move { store.hit(&owned_key, window).await });

        match tokio::time::timeout(self.store_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(StoreError::Unavailable(format!(
                "counter store task failed: {join_err}"
            ))),
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }

    fn decide(&self, key: &str, snapshot: CounterSnapshot) -> Decision {
        let quota = Quota {
            limit: self.max,
            count: snapshot.count,
            remaining: self.max.saturating_sub(snapshot.count),
            reset_after: snapshot.ttl.min(self.window),
        };

        if snapshot.count <= self.max {
            return Decision::Admit { quota: Some(quota) };
        }

        debug!(
            limiter = %self.name,
            key = %key,
            count = snapshot.count,
            limit = self.max,
            "Rate limit exceeded"
        );
        Decision::Reject {
            reason: RejectReason::LimitExceeded,
            retry_after: quota.reset_after,
            quota: Some(quota),
        }
    }

    fn on_store_error(&self, key: &str, err: StoreError) -> Decision {
        match self.failure_policy {
            FailurePolicy::Open => {
                warn!(
                    limiter = %self.name,
                    key = %key,
                    error = %err,
                    "Counter store unavailable, admitting request"
                );
                Decision::Admit { quota: None }
            }
            FailurePolicy::Closed => {
                error!(
                    limiter = %self.name,
                    key = %key,
                    error = %err,
                    "Counter store unavailable, rejecting request"
                );
                Decision::Reject {
                    reason: RejectReason::StoreUnavailable,
                    retry_after: STORE_UNAVAILABLE_RETRY_AFTER,
                    quota: None,
                }
            }
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("max", &self.max)
            .field("window", &self.window)
            .field("key_prefix", &self.key_prefix)
            .field("failure_policy", &self.failure_policy)
            .finish_non_exhaustive()
    }
}
