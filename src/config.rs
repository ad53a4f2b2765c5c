//! Cache configuration

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::storage::CacheStore;
use crate::{CacheError, Result};

/// Which namespaces the coordinator reads from and fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheLevel {
    Off,
    /// Primary-key and unique-key point lookups only
    OnlyPrimary,
    /// Filtered query results only
    OnlySearch,
    #[default]
    All,
}

impl CacheLevel {
    pub fn caches_primary(self) -> bool {
        matches!(self, CacheLevel::OnlyPrimary | CacheLevel::All)
    }

    pub fn caches_search(self) -> bool {
        matches!(self, CacheLevel::OnlySearch | CacheLevel::All)
    }
}

/// Configuration for the cache coordinator
///
/// Immutable once handed to [`Coordinator::new`](crate::Coordinator::new).
#[derive(Clone)]
pub struct CacheConfig {
    pub level: CacheLevel,
    /// Base time-to-live for every entry; zero means no expiration
    pub ttl: Duration,
    /// Result sets with more rows than this are not cached; zero means no limit
    pub max_item_count: usize,
    /// Only these tables are cached; empty caches every table
    pub tables: Vec<String>,
    /// Unique indexes per table, swept on update and delete when a write
    /// does not name their tuples. Indexes seen while filling are added.
    pub unique_indexes: HashMap<String, Vec<String>>,
    /// Purge affected entries after a successful write
    pub invalidate_on_write: bool,
    /// Run fills and invalidations without waiting for them
    pub async_write: bool,
    /// Remember "no rows" results so repeated misses skip the data source
    pub penetration_protection: bool,
    /// Emit per-request access logs at debug level
    pub debug: bool,
    /// Key-space scope; generated at random when unset. Coordinators that
    /// share a store and an instance id share cached entries.
    pub instance_id: Option<String>,
    /// Storage medium; defaults to a bounded in-process store
    pub storage: Option<Arc<dyn CacheStore>>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            level: CacheLevel::All,
            ttl: Duration::ZERO,
            max_item_count: 0,
            tables: Vec::new(),
            unique_indexes: HashMap::new(),
            invalidate_on_write: true,
            async_write: false,
            penetration_protection: true,
            debug: false,
            instance_id: None,
            storage: None,
        }
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("level", &self.level)
            .field("ttl", &self.ttl)
            .field("max_item_count", &self.max_item_count)
            .field("tables", &self.tables)
            .field("unique_indexes", &self.unique_indexes)
            .field("invalidate_on_write", &self.invalidate_on_write)
            .field("async_write", &self.async_write)
            .field("penetration_protection", &self.penetration_protection)
            .field("debug", &self.debug)
            .field("instance_id", &self.instance_id)
            .field("storage", &self.storage.as_ref().map(|s| s.name()))
            .finish()
    }
}

impl CacheConfig {
    pub fn with_level(mut self, level: CacheLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_item_count(mut self, max_item_count: usize) -> Self {
        self.max_item_count = max_item_count;
        self
    }

    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = tables.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_unique_indexes<I, S>(mut self, table: impl Into<String>, indexes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_indexes
            .entry(table.into())
            .or_default()
            .extend(indexes.into_iter().map(Into::into));
        self
    }

    pub fn with_invalidate_on_write(mut self, invalidate: bool) -> Self {
        self.invalidate_on_write = invalidate;
        self
    }

    pub fn with_async_write(mut self, async_write: bool) -> Self {
        self.async_write = async_write;
        self
    }

    pub fn with_penetration_protection(mut self, enabled: bool) -> Self {
        self.penetration_protection = enabled;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn CacheStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Whether reads and writes against `table` go through the cache.
    pub fn should_cache(&self, table: &str) -> bool {
        self.tables.is_empty() || self.tables.iter().any(|t| t == table)
    }

    /// Whether a result set of `count` rows is small enough to cache.
    pub fn within_item_limit(&self, count: usize) -> bool {
        self.max_item_count == 0 || count <= self.max_item_count
    }

    pub fn validate(&self) -> Result<()> {
        if self.tables.iter().any(|t| t.is_empty()) {
            return Err(CacheError::Configuration(
                "table allow-list contains an empty table name".to_owned(),
            ));
        }
        if self
            .unique_indexes
            .iter()
            .any(|(table, indexes)| table.is_empty() || indexes.iter().any(|i| i.is_empty()))
        {
            return Err(CacheError::Configuration(
                "unique index declarations contain an empty name".to_owned(),
            ));
        }
        if let Some(id) = &self.instance_id
            && (id.is_empty() || id.contains(':'))
        {
            return Err(CacheError::Configuration(format!(
                "instance id {id:?} must be non-empty and must not contain ':'"
            )));
        }
        Ok(())
    }
}
