//! rowcache - Read-through, write-invalidated row and query cache
//!
//! A [`Coordinator`] sits between a data-access layer and a relational
//! store:
//! - Point lookups by primary key or unique index are cached one row per key
//! - Filtered query results are cached per (table, query text, parameters)
//! - Concurrent identical reads are coalesced into one upstream fetch
//! - "No rows" results can be cached to shield the store from repeated misses
//! - Successful writes invalidate every entry that could now be stale
//!
//! Entries live in a pluggable [`CacheStore`]: an in-process Moka cache
//! ([`MemoryStore`], the default), a strict LRU ([`LruStore`]) or Redis
//! ([`RedisStore`]). Every entry expires after the configured TTL scaled by a
//! random factor in `[0.9, 1.1]`.
//!
//! ```no_run
//! use rowcache::{CacheConfig, CacheRecord, Coordinator, Fetched, KeyTuple, Query};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct User {
//!     id: i64,
//!     name: String,
//! }
//!
//! impl CacheRecord for User {
//!     fn primary_key(&self) -> Option<KeyTuple> {
//!         (self.id != 0).then(|| KeyTuple::from(self.id))
//!     }
//! }
//!
//! # async fn run() -> rowcache::Result<()> {
//! let cache = Coordinator::new(CacheConfig::default()).await?;
//! let query = Query::new("users", "SELECT * FROM users WHERE id = ?")
//!     .bind(7)
//!     .one()
//!     .by_primary([7]);
//! let user = cache
//!     .query(&query, || async {
//!         Ok::<_, std::io::Error>(Some(Fetched::one(User { id: 7, name: "ann".into() })))
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod coordinator;
mod error;
pub mod keys;
mod lock;
mod query;
mod record;
mod singleflight;
mod stats;
pub mod storage;
mod write;

pub use config::{CacheConfig, CacheLevel};
pub use coordinator::Coordinator;
pub use error::{BoxError, CacheError, Result, SharedError};
pub use keys::{KeySpace, KeyTuple, Param};
pub use query::{Fetched, Lookup, Query, Shape};
pub use record::{CacheRecord, Cacheable};
pub use storage::{
    CacheStore, Kv, LruStore, LruStoreConfig, MemoryStore, MemoryStoreConfig, RedisStore,
    RedisStoreConfig, StoreSettings,
};
pub use write::{UniqueIndexKeys, WriteEvent, WriteKind};

// Re-export async_trait for custom store implementations
pub use async_trait::async_trait;
