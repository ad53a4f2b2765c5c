//! Bounded in-process store on a Moka cache.
//!
//! Each entry carries the jittered TTL it was written with; a per-entry
//! [`Expiry`] policy applies it. Expired entries are never returned.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use tracing::debug;

use super::{CacheStore, Kv, PREFIX_DELETE_BATCH, StoreSettings, has_segment_prefix};
use crate::{CacheError, Result};

/// Configuration for [`MemoryStore`]
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Maximum number of entries kept before eviction
    pub max_capacity: u64,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self { max_capacity: 1000 }
    }
}

#[derive(Clone)]
struct Stored {
    value: Arc<str>,
    ttl: Duration,
}

struct JitteredExpiry;

impl Expiry<String, Stored> for JitteredExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Stored,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Stored,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process store, the default when no storage is configured.
pub struct MemoryStore {
    cache: Cache<String, Stored>,
    settings: OnceLock<StoreSettings>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

impl MemoryStore {
    pub fn new(config: MemoryStoreConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .expire_after(JitteredExpiry)
            .build();
        Self {
            cache,
            settings: OnceLock::new(),
        }
    }

    fn settings(&self) -> Result<&StoreSettings> {
        self.settings
            .get()
            .ok_or_else(|| CacheError::Configuration("memory store used before init".to_owned()))
    }

    fn stored(&self, value: String) -> Result<Stored> {
        Ok(Stored {
            value: Arc::from(value),
            ttl: self.settings()?.next_bounded_ttl(),
        })
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn init(&self, settings: StoreSettings) -> Result<()> {
        if self.settings.set(settings).is_err() {
            debug!("memory store already initialized, keeping first settings");
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.cache.get(key).await.is_some())
    }

    async fn get(&self, key: &str) -> Result<String> {
        self.cache
            .get(key)
            .await
            .map(|stored| stored.value.to_string())
            .ok_or(CacheError::NotFound)
    }

    async fn batch_get(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.cache.get(key).await.map(|stored| stored.value.to_string()));
        }
        Ok(values)
    }

    async fn set(&self, kv: Kv) -> Result<()> {
        let stored = self.stored(kv.value)?;
        self.cache.insert(kv.key, stored).await;
        Ok(())
    }

    async fn batch_set(&self, kvs: Vec<Kv>) -> Result<()> {
        for kv in kvs {
            self.set(kv).await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn batch_delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.cache.invalidate(key).await;
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let matching: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(key, _)| has_segment_prefix(key, prefix))
            .map(|(key, _)| key)
            .collect();

        for chunk in matching.chunks(PREFIX_DELETE_BATCH) {
            for key in chunk {
                self.cache.invalidate(key.as_str()).await;
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

#[cfg(test)]
mod tests {
    use super::*;

    async fn store(ttl: Duration) -> MemoryStore {
        let store = MemoryStore::default();
        store
            .init(StoreSettings {
                ttl,
                debug: false,
                scope: "inst".to_owned(),
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn key_expires_after_ttl() {
        let store = store(Duration::from_millis(100)).await;
        store.set(Kv::new("inst:k", "v")).await.unwrap();
        assert!(store.exists("inst:k").await.unwrap());
        assert_eq!(store.get("inst:k").await.unwrap(), "v");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!store.exists("inst:k").await.unwrap());
        assert!(store.get("inst:k").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn zero_ttl_does_not_expire_in_test_window() {
        let store = store(Duration::ZERO).await;
        store.set(Kv::new("inst:k", "v")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.exists("inst:k").await.unwrap());
    }

    #[tokio::test]
    async fn batch_get_is_index_aligned() {
        let store = store(Duration::ZERO).await;
        store
            .batch_set(vec![Kv::new("A", "1"), Kv::new("B", "2")])
            .await
            .unwrap();
        let values = store
            .batch_get(&["A".to_owned(), "B".to_owned(), "C".to_owned()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some("1".to_owned()), Some("2".to_owned()), None]);
    }

    #[tokio::test]
    async fn batch_exists_requires_every_key() {
        let store = store(Duration::ZERO).await;
        assert!(store.batch_exists(&[]).await.unwrap());

        store.set(Kv::new("k1", "v")).await.unwrap();
        assert!(store.batch_exists(&["k1".to_owned()]).await.unwrap());
        assert!(!store
            .batch_exists(&["k1".to_owned(), "k2".to_owned()])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn delete_prefix_stays_inside_the_prefix() {
        let store = store(Duration::ZERO).await;
        store
            .batch_set(vec![
                Kv::new("inst:s:users:q1", "a"),
                Kv::new("inst:s:users:q2", "b"),
                Kv::new("inst:s:users_archive:q1", "c"),
                Kv::new("inst:p:users:1", "d"),
            ])
            .await
            .unwrap();

        store.delete_prefix("inst:s:users").await.unwrap();

        assert!(!store.exists("inst:s:users:q1").await.unwrap());
        assert!(!store.exists("inst:s:users:q2").await.unwrap());
        assert!(store.exists("inst:s:users_archive:q1").await.unwrap());
        assert!(store.exists("inst:p:users:1").await.unwrap());
    }

    #[tokio::test]
    async fn delete_and_batch_delete() {
        let store = store(Duration::ZERO).await;
        store
            .batch_set(vec![Kv::new("a", "1"), Kv::new("b", "2"), Kv::new("c", "3")])
            .await
            .unwrap();
        store.delete("a").await.unwrap();
        store.batch_delete(&["b".to_owned()]).await.unwrap();
        assert!(!store.exists("a").await.unwrap());
        assert!(!store.exists("b").await.unwrap());
        assert!(store.exists("c").await.unwrap());
    }

    #[tokio::test]
    async fn clear_sweeps_only_the_owned_scope() {
        let store = store(Duration::ZERO).await;
        store.set(Kv::new("inst:p:users:1", "a")).await.unwrap();
        store.set(Kv::new("other:p:users:1", "b")).await.unwrap();
        store.clear().await.unwrap();
        assert!(!store.exists("inst:p:users:1").await.unwrap());
        assert!(store.exists("other:p:users:1").await.unwrap());
    }

    #[tokio::test]
    async fn second_init_keeps_first_settings() {
        let store = store(Duration::from_millis(100)).await;
        store
            .init(StoreSettings {
                ttl: Duration::ZERO,
                debug: true,
                scope: "other".to_owned(),
            })
            .await
            .unwrap();
        assert_eq!(store.settings().unwrap().ttl, Duration::from_millis(100));

        store.set(Kv::new("inst:k", "v")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!store.exists("inst:k").await.unwrap());
    }

    #[tokio::test]
    async fn writes_before_init_are_rejected() {
        let store = MemoryStore::default();
        assert!(matches!(
            store.set(Kv::new("k", "v")).await,
            Err(CacheError::Configuration(_))
        ));
    }
}
