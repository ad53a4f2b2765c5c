//! Strict LRU in-process store.
//!
//! Entries remember their own deadline; an expired entry reads as absent and
//! is dropped on the next access. The lock is never held across an await.

use std::num::NonZeroUsize;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use async_trait::async_trait;
use lru::LruCache;
use tracing::debug;

use super::{CacheStore, Kv, PREFIX_DELETE_BATCH, StoreSettings, has_segment_prefix};
use crate::lock::mutex_lock;
use crate::{CacheError, Result};

const SOURCE: &str = "storage::lru";

/// Configuration for [`LruStore`]
#[derive(Debug, Clone)]
pub struct LruStoreConfig {
    /// Maximum number of entries; the least recently used is evicted first
    pub capacity: usize,
}

impl Default for LruStoreConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

pub struct LruStore {
    entries: Mutex<LruCache<String, Slot>>,
    settings: OnceLock<StoreSettings>,
}

impl LruStore {
    pub fn new(config: LruStoreConfig) -> Result<Self> {
        let capacity = NonZeroUsize::new(config.capacity).ok_or_else(|| {
            CacheError::Configuration("lru store capacity must be greater than zero".to_owned())
        })?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
            settings: OnceLock::new(),
        })
    }

    fn settings(&self) -> Result<&StoreSettings> {
        self.settings
            .get()
            .ok_or_else(|| CacheError::Configuration("lru store used before init".to_owned()))
    }

    fn slot(&self, value: String) -> Result<Slot> {
        let expires_at = self
            .settings()?
            .next_ttl()
            .map(|ttl| Instant::now() + ttl);
        Ok(Slot { value, expires_at })
    }
}

/// Live value for `key`, evicting it if it has expired.
fn live_value(entries: &mut LruCache<String, Slot>, key: &str, now: Instant) -> Option<String> {
    let expired = entries.peek(key)?.is_expired(now);
    if expired {
        entries.pop(key);
        return None;
    }
    entries.get(key).map(|slot| slot.value.clone())
}

#[async_trait]
impl CacheStore for LruStore {
    fn name(&self) -> &'static str {
        "lru"
    }

    async fn init(&self, settings: StoreSettings) -> Result<()> {
        if self.settings.set(settings).is_err() {
            debug!("lru store already initialized, keeping first settings");
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "exists");
        Ok(live_value(&mut entries, key, Instant::now()).is_some())
    }

    async fn batch_exists(&self, keys: &[String]) -> Result<bool> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "batch_exists");
        let now = Instant::now();
        Ok(keys
            .iter()
            .all(|key| live_value(&mut entries, key, now).is_some()))
    }

    async fn get(&self, key: &str) -> Result<String> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "get");
        live_value(&mut entries, key, Instant::now()).ok_or(CacheError::NotFound)
    }

    async fn batch_get(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "batch_get");
        let now = Instant::now();
        Ok(keys
            .iter()
            .map(|key| live_value(&mut entries, key, now))
            .collect())
    }

    async fn set(&self, kv: Kv) -> Result<()> {
        let slot = self.slot(kv.value)?;
        mutex_lock(&self.entries, SOURCE, "set").put(kv.key, slot);
        Ok(())
    }

    async fn batch_set(&self, kvs: Vec<Kv>) -> Result<()> {
        let slots = kvs
            .into_iter()
            .map(|kv| Ok((kv.key, self.slot(kv.value)?)))
            .collect::<Result<Vec<_>>>()?;
        let mut entries = mutex_lock(&self.entries, SOURCE, "batch_set");
        for (key, slot) in slots {
            entries.put(key, slot);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        mutex_lock(&self.entries, SOURCE, "delete").pop(key);
        Ok(())
    }

    async fn batch_delete(&self, keys: &[String]) -> Result<()> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "batch_delete");
        for key in keys {
            entries.pop(key.as_str());
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let matching: Vec<String> = mutex_lock(&self.entries, SOURCE, "delete_prefix.scan")
            .iter()
            .filter(|(key, _)| has_segment_prefix(key, prefix))
            .map(|(key, _)| key.clone())
            .collect();

        for chunk in matching.chunks(PREFIX_DELETE_BATCH) {
            {
                let mut entries = mutex_lock(&self.entries, SOURCE, "delete_prefix");
                for key in chunk {
                    entries.pop(key.as_str());
                }
            }
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let scope = self.settings()?.scope.clone();
        self.delete_prefix(&scope).await
    }
}
