//! Storage backends
//!
//! Every backend stores opaque string payloads under string keys and honours
//! the same contract:
//! - `batch_get` is index-aligned: one slot per requested key, `None` where
//!   the key is absent or expired.
//! - each write draws its own jittered TTL from the base TTL given to `init`.
//! - `delete_prefix(p)` removes keys of the form `{p}:...`; a prefix always
//!   ends on a whole key segment, so `users` never sweeps `users_archive`.
//! - `init` is idempotent; only the first call's settings take effect.
//!
//! Cancellation follows the usual async rules: dropping an operation's future
//! abandons it, and callers impose deadlines with `tokio::time::timeout`.

mod lru_store;
mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::Result;

pub use self::lru_store::{LruStore, LruStoreConfig};
pub use self::memory::{MemoryStore, MemoryStoreConfig};
pub use self::redis_store::{RedisStore, RedisStoreConfig};

/// Bound substituted for "no expiration" on media that need one.
pub const UNBOUNDED_TTL_FALLBACK: Duration = Duration::from_secs(24 * 60 * 60);

/// Keys deleted per round trip during a prefix sweep.
pub const PREFIX_DELETE_BATCH: usize = 5000;

const JITTER_LOW: f64 = 0.9;
const JITTER_HIGH: f64 = 1.1;

/// A key/value pair to store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kv {
    pub key: String,
    pub value: String,
}

impl Kv {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Settings handed to a backend by its coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    /// Base TTL; zero means no expiration
    pub ttl: Duration,
    pub debug: bool,
    /// Prefix owned by the coordinator; `clear` sweeps exactly this
    pub scope: String,
}

impl StoreSettings {
    /// TTL for the next write, or `None` when entries never expire.
    pub fn next_ttl(&self) -> Option<Duration> {
        if self.ttl.is_zero() {
            None
        } else {
            Some(jittered(self.ttl))
        }
    }

    /// TTL for the next write on media that require an expiration.
    pub fn next_bounded_ttl(&self) -> Duration {
        self.next_ttl()
            .unwrap_or_else(|| jittered(UNBOUNDED_TTL_FALLBACK))
    }
}

/// Scale `base` by a random factor in `[0.9, 1.1]` so entries written
/// together do not expire together.
pub fn jittered(base: Duration) -> Duration {
    let factor = rand::rng().random_range(JITTER_LOW..=JITTER_HIGH);
    base.mul_f64(factor)
}

/// Whether `key` lies under `prefix` as a whole key segment.
pub(crate) fn has_segment_prefix(key: &str, prefix: &str) -> bool {
    key.strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with(':'))
}

/// Uniform key/value contract over one storage medium.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// One-time setup; later calls are no-ops that return `Ok`.
    async fn init(&self, settings: StoreSettings) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// True only if every key exists; true for an empty list.
    async fn batch_exists(&self, keys: &[String]) -> Result<bool> {
        for key in keys {
            if !self.exists(key).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The stored value, or [`CacheError::NotFound`](crate::CacheError::NotFound).
    async fn get(&self, key: &str) -> Result<String>;

    /// One slot per key, in request order.
    async fn batch_get(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    async fn set(&self, kv: Kv) -> Result<()>;

    async fn batch_set(&self, kvs: Vec<Kv>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn batch_delete(&self, keys: &[String]) -> Result<()>;

    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// Remove every entry under the scope given to `init`.
    async fn clear(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_ten_percent() {
        let base = Duration::from_millis(1000);
        for _ in 0..10_000 {
            let ttl = jittered(base);
            assert!(ttl >= Duration::from_millis(900), "{ttl:?} below band");
            assert!(ttl <= Duration::from_millis(1100), "{ttl:?} above band");
        }
    }

    #[test]
    fn jitter_actually_varies() {
        let base = Duration::from_secs(60);
        let first = jittered(base);
        assert!((0..100).any(|_| jittered(base) != first));
    }

    #[test]
    fn zero_ttl_is_unbounded() {
        let settings = StoreSettings {
            ttl: Duration::ZERO,
            debug: false,
            scope: "abc12".to_owned(),
        };
        assert_eq!(settings.next_ttl(), None);
        let bounded = settings.next_bounded_ttl();
        assert!(bounded >= UNBOUNDED_TTL_FALLBACK.mul_f64(JITTER_LOW));
    }

    #[test]
    fn segment_prefix_respects_boundaries() {
        assert!(has_segment_prefix("id:p:users:1", "id:p:users"));
        assert!(!has_segment_prefix("id:p:users_archive:1", "id:p:users"));
        assert!(!has_segment_prefix("id:p:users", "id:p:users"));
        assert!(!has_segment_prefix("other:p:users:1", "id:p:users"));
    }
}
