//! Networked store on Redis.
//!
//! Connections go through a [`ConnectionManager`], which reconnects on its
//! own. Batch existence runs as one server-side script; prefix deletes walk
//! the key space with `SCAN` and delete in bounded chunks.

use std::sync::OnceLock;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{CacheStore, Kv, PREFIX_DELETE_BATCH, StoreSettings};
use crate::{CacheError, Result};

/// Returns 1 only if every key in KEYS exists, stopping at the first miss.
const BATCH_EXISTS_SCRIPT: &str = r#"
for _, key in ipairs(KEYS) do
    if redis.call('EXISTS', key) == 0 then
        return 0
    end
end
return 1
"#;

const SCAN_COUNT: usize = 1000;

/// Configuration for [`RedisStore`]; one of `url` or `client` is required.
#[derive(Debug, Clone, Default)]
pub struct RedisStoreConfig {
    pub url: Option<String>,
    pub client: Option<redis::Client>,
}

impl RedisStoreConfig {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            client: None,
        }
    }

    pub fn from_client(client: redis::Client) -> Self {
        Self {
            url: None,
            client: Some(client),
        }
    }
}

pub struct RedisStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    batch_exists: redis::Script,
    settings: OnceLock<StoreSettings>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection", &"<ConnectionManager>")
            .field("settings", &self.settings.get())
            .finish()
    }
}

impl RedisStore {
    /// Build the store; no connection is made until [`CacheStore::init`].
    pub fn new(config: RedisStoreConfig) -> Result<Self> {
        let client = match (config.client, config.url) {
            (Some(client), _) => client,
            (None, Some(url)) => redis::Client::open(url.as_str()).map_err(|e| {
                CacheError::Configuration(format!("invalid redis url {url:?}: {e}"))
            })?,
            (None, None) => {
                return Err(CacheError::Configuration(
                    "redis store needs a url or a client".to_owned(),
                ));
            }
        };
        Ok(Self {
            client,
            connection: OnceCell::new(),
            batch_exists: redis::Script::new(BATCH_EXISTS_SCRIPT),
            settings: OnceLock::new(),
        })
    }

    /// Connect and load the batch-exists script; runs once per store.
    async fn connect(&self) -> Result<ConnectionManager> {
        let mut conn = ConnectionManager::new(self.client.clone()).await?;
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(BATCH_EXISTS_SCRIPT)
            .query_async(&mut conn)
            .await?;
        info!(script = %sha, "redis store initialized");
        Ok(conn)
    }

    fn connection(&self) -> Result<ConnectionManager> {
        self.connection
            .get()
            .cloned()
            .ok_or_else(|| CacheError::Configuration("redis store used before init".to_owned()))
    }

    fn settings(&self) -> Result<&StoreSettings> {
        self.settings
            .get()
            .ok_or_else(|| CacheError::Configuration("redis store used before init".to_owned()))
    }

    fn set_command(&self, kv: &Kv) -> Result<redis::Cmd> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(&kv.key).arg(&kv.value);
        if let Some(ttl) = self.settings()?.next_ttl() {
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            cmd.arg("PX").arg(millis);
        }
        Ok(cmd)
    }
}

/// Escape glob metacharacters so a key prefix matches literally in `SCAN MATCH`.
fn scan_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 3);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push_str(":*");
    pattern
}

#[async_trait]
impl CacheStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn init(&self, settings: StoreSettings) -> Result<()> {
        if self.settings.set(settings).is_err() {
            debug!("redis store already initialized, keeping first settings");
        }
        self.connection.get_or_try_init(|| self.connect()).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection()?;
        let count: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(count > 0)
    }

    async fn batch_exists(&self, keys: &[String]) -> Result<bool> {
        if keys.is_empty() {
            return Ok(true);
        }
        let mut conn = self.connection()?;
        let mut invocation = self.batch_exists.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        let all: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(all == 1)
    }

    async fn get(&self, key: &str) -> Result<String> {
        let mut conn = self.connection()?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        value.ok_or(CacheError::NotFound)
    }

    async fn batch_get(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection()?;
        let mut values: Vec<Option<String>> =
            redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        values.resize(keys.len(), None);
        Ok(values)
    }

    async fn set(&self, kv: Kv) -> Result<()> {
        let mut conn = self.connection()?;
        let () = self.set_command(&kv)?.query_async(&mut conn).await?;
        Ok(())
    }

    async fn batch_set(&self, kvs: Vec<Kv>) -> Result<()> {
        if kvs.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection()?;
        let mut pipe = redis::pipe();
        for kv in &kvs {
            pipe.add_command(self.set_command(kv)?).ignore();
        }
        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection()?;
        let () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn batch_delete(&self, keys: &[String]) -> Result<()> {
        let mut conn = self.connection()?;
        for chunk in keys.chunks(PREFIX_DELETE_BATCH) {
            let () = redis::cmd("DEL").arg(chunk).query_async(&mut conn).await?;
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut conn = self.connection()?;
        let pattern = scan_pattern(prefix);
        let mut cursor = 0u64;
        let mut pending: Vec<String> = Vec::new();
        let mut deleted = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            pending.extend(keys);

            if pending.len() >= PREFIX_DELETE_BATCH || (next == 0 && !pending.is_empty()) {
                for chunk in pending.chunks(PREFIX_DELETE_BATCH) {
                    let () = redis::cmd("DEL").arg(chunk).query_async(&mut conn).await?;
                }
                deleted += pending.len();
                pending.clear();
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        if self.settings.get().is_some_and(|s| s.debug) {
            debug!(prefix, deleted, "redis prefix sweep finished");
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
    use std::time::Duration;

    #[test]
    fn missing_connection_details_are_rejected() {
        assert!(matches!(
            RedisStore::new(RedisStoreConfig::default()),
            Err(CacheError::Configuration(_))
        ));
    }

    #[test]
    fn invalid_url_is_a_configuration_error() {
        assert!(matches!(
            RedisStore::new(RedisStoreConfig::from_url("not a url")),
            Err(CacheError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn operations_before_init_are_rejected() {
        let store = RedisStore::new(RedisStoreConfig::from_url("redis://127.0.0.1/")).unwrap();
        assert!(matches!(
            store.get("k").await,
            Err(CacheError::Configuration(_))
        ));
    }

    #[test]
    fn scan_pattern_escapes_glob_characters() {
        assert_eq!(scan_pattern("id:s:users"), "id:s:users:*");
        assert_eq!(
            scan_pattern("id:s:t:select * from t where a in [?]"),
            "id:s:t:select \\* from t where a in \\[\\?\\]:*"
        );
    }

    async fn live_store(ttl: Duration, scope: &str) -> RedisStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_owned());
        let store = RedisStore::new(RedisStoreConfig::from_url(url)).unwrap();
        store
            .init(StoreSettings {
                ttl,
                debug: true,
                scope: scope.to_owned(),
            })
            .await
            .unwrap();
        store.clear().await.unwrap();
        store
    }

    #[tokio::test]
    #[ignore = "requires a running redis server (REDIS_URL)"]
    async fn second_init_keeps_first_settings_and_connection() {
        let store = live_store(Duration::from_millis(100), "rtest0").await;
        store
            .init(StoreSettings {
                ttl: Duration::ZERO,
                debug: false,
                scope: "other".to_owned(),
            })
            .await
            .unwrap();
        let settings = store.settings().unwrap();
        assert_eq!(settings.ttl, Duration::from_millis(100));
        assert_eq!(settings.scope, "rtest0");
    }

    #[tokio::test]
    #[ignore = "requires a running redis server (REDIS_URL)"]
    async fn key_expires_after_ttl() {
        let store = live_store(Duration::from_millis(100), "rtest1").await;
        store.set(Kv::new("rtest1:k", "v")).await.unwrap();
        assert!(store.exists("rtest1:k").await.unwrap());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!store.exists("rtest1:k").await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires a running redis server (REDIS_URL)"]
    async fn batch_operations_are_index_aligned() {
        let store = live_store(Duration::ZERO, "rtest2").await;
        store
            .batch_set(vec![Kv::new("rtest2:A", "1"), Kv::new("rtest2:B", "2")])
            .await
            .unwrap();
        let keys = ["rtest2:A", "rtest2:B", "rtest2:C"].map(str::to_owned);
        assert_eq!(
            store.batch_get(&keys).await.unwrap(),
            vec![Some("1".to_owned()), Some("2".to_owned()), None]
        );
        assert!(store.batch_exists(&keys[..2]).await.unwrap());
        assert!(!store.batch_exists(&keys).await.unwrap());
        assert!(store.batch_exists(&[]).await.unwrap());
        store.clear().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running redis server (REDIS_URL)"]
    async fn delete_prefix_sweeps_large_key_counts() {
        let store = live_store(Duration::ZERO, "rtest3").await;
        let kvs: Vec<Kv> = (0..12_000)
            .map(|i| Kv::new(format!("rtest3:s:users:{i}"), "x"))
            .collect();
        store.batch_set(kvs).await.unwrap();
        store.set(Kv::new("rtest3:s:users_archive:1", "y")).await.unwrap();

        store.delete_prefix("rtest3:s:users").await.unwrap();
        assert!(!store.exists("rtest3:s:users:0").await.unwrap());
        assert!(!store.exists("rtest3:s:users:11999").await.unwrap());
        assert!(store.exists("rtest3:s:users_archive:1").await.unwrap());
        store.clear().await.unwrap();
    }
}
