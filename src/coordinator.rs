//! Cache coordinator
//!
//! Owns the key-space, the store and the coalescing registry, and exposes
//! direct namespace operations. The read path lives in [`crate::query`] and
//! the write path in [`crate::write`].

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, join_all};
use tracing::{error, info};

use crate::config::{CacheConfig, CacheLevel};
use crate::keys::{KeySpace, KeyTuple, Param, generate_instance_id};
use crate::lock::mutex_lock;
use crate::query::{FlightOutcome, Query};
use crate::singleflight::Group;
use crate::stats::Stats;
use crate::storage::{CacheStore, Kv, MemoryStore, StoreSettings};
use crate::Result;

/// Background unit of cache maintenance (fill or invalidation).
pub(crate) type Task = BoxFuture<'static, ()>;

/// Log at debug level only when the coordinator runs in debug mode.
macro_rules! access {
    ($coordinator:expr, $($arg:tt)+) => {
        if $coordinator.inner.config.debug {
            ::tracing::debug!($($arg)+);
        }
    };
}
pub(crate) use access;

/// Read-through, write-invalidated cache in front of one data source.
///
/// Cloning is cheap; clones share the store, the statistics and the
/// coalescing registry.
#[derive(Clone)]
pub struct Coordinator {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: CacheConfig,
    pub(crate) keys: KeySpace,
    pub(crate) store: Arc<dyn CacheStore>,
    pub(crate) stats: Stats,
    pub(crate) flights: Group<FlightOutcome>,
    /// Unique index names per table, declared or seen while filling
    unique_indexes: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("instance_id", &self.inner.keys.instance_id())
            .field("store", &self.inner.store.name())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Coordinator {
    /// Validate `config`, pick the store and initialize it.
    ///
    /// Without a configured store an in-process [`MemoryStore`] is used.
    pub async fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(generate_instance_id);
        let store: Arc<dyn CacheStore> = match &config.storage {
            Some(store) => Arc::clone(store),
            None => Arc::new(MemoryStore::default()),
        };

        store
            .init(StoreSettings {
                ttl: config.ttl,
                debug: config.debug,
                scope: instance_id.clone(),
            })
            .await
            .inspect_err(|e| error!(store = store.name(), error = %e, "cache store init failed"))?;

        info!(
            instance_id = %instance_id,
            store = store.name(),
            level = ?config.level,
            "cache coordinator initialized"
        );

        let unique_indexes = config
            .unique_indexes
            .iter()
            .map(|(table, indexes)| (table.clone(), indexes.iter().cloned().collect()))
            .collect();

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                keys: KeySpace::new(instance_id),
                store,
                stats: Stats::default(),
                flights: Group::new(),
                unique_indexes: Mutex::new(unique_indexes),
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn instance_id(&self) -> &str {
        self.inner.keys.instance_id()
    }

    pub fn key_space(&self) -> &KeySpace {
        &self.inner.keys
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.inner.store
    }

    pub fn hit_count(&self) -> u64 {
        self.inner.stats.hits()
    }

    pub fn miss_count(&self) -> u64 {
        self.inner.stats.misses()
    }

    pub fn lookup_count(&self) -> u64 {
        self.inner.stats.lookups()
    }

    /// hits / (hits + misses); 0.0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        self.inner.stats.hit_rate()
    }

    /// Zero the statistics and drop every entry this coordinator owns.
    ///
    /// Sweeps this coordinator's instance id rather than calling
    /// [`CacheStore::clear`], since a shared store keeps the scope of
    /// whichever coordinator initialized it first.
    pub async fn reset(&self) -> Result<()> {
        self.inner.stats.reset();
        self.inner
            .store
            .delete_prefix(self.instance_id())
            .await
            .inspect_err(|e| error!(error = %e, "cache reset failed"))
    }

    /// Number of distinct reads currently being fetched.
    pub fn in_flight_count(&self) -> usize {
        self.inner.flights.in_flight()
    }

    /// Stop late callers from joining the in-flight read for `query`.
    pub fn forget_in_flight(&self, query: &Query) {
        self.inner.flights.forget(&query.flight_key());
    }

    pub(crate) fn remember_unique_indexes(&self, table: &str, indexes: BTreeSet<String>) {
        if indexes.is_empty() {
            return;
        }
        let mut known = mutex_lock(&self.inner.unique_indexes, "coordinator", "remember_indexes");
        match known.get_mut(table) {
            Some(names) => names.extend(indexes),
            None => {
                known.insert(table.to_owned(), indexes);
            }
        }
    }

    /// Unique indexes known for `table`, in name order.
    pub(crate) fn unique_indexes(&self, table: &str) -> Vec<String> {
        mutex_lock(&self.inner.unique_indexes, "coordinator", "unique_indexes")
            .get(table)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn is_cached_table(&self, table: &str) -> bool {
        let config = &self.inner.config;
        config.level != CacheLevel::Off && config.should_cache(table)
    }

    /// Run fills or invalidations: awaited together, or detached when
    /// `async_write` is set. Detached tasks log their own failures.
    pub(crate) async fn dispatch(&self, tasks: Vec<Task>) {
        if tasks.is_empty() {
            return;
        }
        if self.inner.config.async_write {
            for task in tasks {
                tokio::spawn(task);
            }
        } else {
            join_all(tasks).await;
        }
    }

    fn primary_keys(&self, table: &str, keys: &[KeyTuple]) -> Vec<String> {
        keys.iter()
            .map(|key| self.inner.keys.primary_key(table, key))
            .collect()
    }

    fn unique_keys(&self, table: &str, index: &str, keys: &[KeyTuple]) -> Vec<String> {
        keys.iter()
            .map(|key| self.inner.keys.unique_key(table, index, key))
            .collect()
    }

    pub async fn invalidate_search_cache(&self, table: &str) -> Result<()> {
        let prefix = self.inner.keys.search_prefix(table);
        self.inner.store.delete_prefix(&prefix).await
    }

    pub async fn invalidate_primary_cache(&self, table: &str, key: &KeyTuple) -> Result<()> {
        let key = self.inner.keys.primary_key(table, key);
        self.inner.store.delete(&key).await
    }

    pub async fn batch_invalidate_primary_cache(
        &self,
        table: &str,
        keys: &[KeyTuple],
    ) -> Result<()> {
        self.inner
            .store
            .batch_delete(&self.primary_keys(table, keys))
            .await
    }

    pub async fn invalidate_all_primary_cache(&self, table: &str) -> Result<()> {
        let prefix = self.inner.keys.primary_prefix(table);
        self.inner.store.delete_prefix(&prefix).await
    }

    pub async fn batch_invalidate_unique_cache(
        &self,
        table: &str,
        index: &str,
        keys: &[KeyTuple],
    ) -> Result<()> {
        self.inner
            .store
            .batch_delete(&self.unique_keys(table, index, keys))
            .await
    }

    pub async fn invalidate_all_unique_cache(&self, table: &str, index: &str) -> Result<()> {
        let prefix = self.inner.keys.unique_prefix(table, index);
        self.inner.store.delete_prefix(&prefix).await
    }

    /// True only if every primary entry is cached.
    pub async fn batch_primary_key_exists(&self, table: &str, keys: &[KeyTuple]) -> Result<bool> {
        self.inner
            .store
            .batch_exists(&self.primary_keys(table, keys))
            .await
    }

    pub async fn search_key_exists(
        &self,
        table: &str,
        sql: &str,
        params: &[Param],
    ) -> Result<bool> {
        let key = self.inner.keys.search_key(table, sql, params);
        self.inner.store.exists(&key).await
    }

    /// Store one encoded row per primary-key tuple.
    pub async fn batch_set_primary_cache(
        &self,
        table: &str,
        rows: Vec<(KeyTuple, String)>,
    ) -> Result<()> {
        let kvs = rows
            .into_iter()
            .map(|(key, value)| Kv::new(self.inner.keys.primary_key(table, &key), value))
            .collect();
        self.inner.store.batch_set(kvs).await
    }

    pub async fn batch_set_unique_cache(
        &self,
        table: &str,
        index: &str,
        rows: Vec<(KeyTuple, String)>,
    ) -> Result<()> {
        let kvs = rows
            .into_iter()
            .map(|(key, value)| Kv::new(self.inner.keys.unique_key(table, index, &key), value))
            .collect();
        self.remember_unique_indexes(table, BTreeSet::from([index.to_owned()]));
        self.inner.store.batch_set(kvs).await
    }

    pub async fn set_search_cache(
        &self,
        table: &str,
        sql: &str,
        params: &[Param],
        value: impl Into<String>,
    ) -> Result<()> {
        let key = self.inner.keys.search_key(table, sql, params);
        self.inner.store.set(Kv::new(key, value)).await
    }

    /// Raw stored search value, or [`CacheError::NotFound`](crate::CacheError::NotFound).
    pub async fn get_search_cache(
        &self,
        table: &str,
        sql: &str,
        params: &[Param],
    ) -> Result<String> {
        let key = self.inner.keys.search_key(table, sql, params);
        self.inner.store.get(&key).await
    }

    /// Encoded rows aligned with `keys`; `None` where nothing is cached.
    pub async fn batch_get_primary_cache(
        &self,
        table: &str,
        keys: &[KeyTuple],
    ) -> Result<Vec<Option<String>>> {
        self.inner
            .store
            .batch_get(&self.primary_keys(table, keys))
            .await
    }

    pub async fn batch_get_unique_cache(
        &self,
        table: &str,
        index: &str,
        keys: &[KeyTuple],
    ) -> Result<Vec<Option<String>>> {
        self.inner
            .store
            .batch_get(&self.unique_keys(table, index, keys))
            .await
    }
}
