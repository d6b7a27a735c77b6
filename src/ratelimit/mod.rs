//! Rate limiting logic and counter storage.

mod clock;
mod key;
mod limiter;
mod memory;
mod redis_store;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{ClientAddrKey, HeaderKey, KeyExtractor, KeyStrategy, UserKey};
pub use limiter::{Decision, FailurePolicy, Quota, RateLimiter, RejectReason};
pub use memory::InMemoryCounterStore;
pub use redis_store::{ConnectionTimeouts, RedisCounterStore};
pub use store::{connect_store, CounterSnapshot, CounterStore};
