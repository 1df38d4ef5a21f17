//! Plain key-value cache with JSON values
//!
//! Reads never fail: a store outage or an undecodable value is logged and
//! treated as a miss, and [`CacheManager::with_cache`] falls through to the
//! caller's fetch function.

use crate::error::{CacheError, Result};
use crate::metrics::CacheMetrics;
use crate::store::{KeyNamespace, KeyValueStore, Lookup};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-call options for [`CacheManager`]
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// TTL in seconds, defaulting to the manager's default
    pub ttl: Option<u64>,
    /// Optional namespace segment between the root and the key
    pub prefix: Option<String>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
}

/// Cache of JSON-encoded values under `<root>:<prefix?>:<key>`
pub struct CacheManager {
    store: Arc<dyn KeyValueStore>,
    namespace: KeyNamespace,
    default_ttl: u64,
    metrics: Arc<CacheMetrics>,
}

impl CacheManager {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        namespace: KeyNamespace,
        default_ttl: u64,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            store,
            namespace,
            default_ttl,
            metrics,
        }
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    fn key(&self, key: &str, options: &CacheOptions) -> String {
        self.namespace.cache_key(key, options.prefix.as_deref())
    }

    /// Read and decode a value, distinguishing a miss from a degraded store
    pub async fn lookup<T: DeserializeOwned>(&self, key: &str, options: &CacheOptions) -> Lookup<T> {
        let cache_key = self.key(key, options);

        let bytes = match self.store.get(&cache_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Lookup::Miss,
            Err(e) => return Lookup::Degraded(e),
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Lookup::Hit(value),
            Err(e) => Lookup::Degraded(CacheError::from(e)),
        }
    }

    /// Read a value; `None` on miss, outage, or decode failure
    pub async fn get<T: DeserializeOwned>(&self, key: &str, options: &CacheOptions) -> Option<T> {
        match self.lookup(key, options).await {
            Lookup::Hit(value) => {
                debug!("Cache hit: {}", key);
                self.metrics.record_cache_hit();
                Some(value)
            }
            Lookup::Miss => {
                debug!("Cache miss: {}", key);
                self.metrics.record_cache_miss();
                None
            }
            Lookup::Degraded(e) => {
                warn!("Cache get error for {}: {}", key, e);
                self.metrics.record_error("cache_manager", &e);
                self.metrics.record_cache_miss();
                None
            }
        }
    }

    async fn try_set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: &CacheOptions,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        let ttl = Duration::from_secs(options.ttl.unwrap_or(self.default_ttl));
        self.store
            .set_with_expiry(&self.key(key, options), &bytes, ttl)
            .await
    }

    /// Store a value; returns whether it was written
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, options: &CacheOptions) -> bool {
        match self.try_set(key, value, options).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Cache set error for {}: {}", key, e);
                self.metrics.record_error("cache_manager", &e);
                false
            }
        }
    }

    /// Delete a value; returns whether the command succeeded
    pub async fn del(&self, key: &str, options: &CacheOptions) -> bool {
        match self.store.delete(&self.key(key, options)).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Cache delete error for {}: {}", key, e);
                self.metrics.record_error("cache_manager", &e);
                false
            }
        }
    }

    /// Delete every key under `prefix`, or everything under the root when `None`
    ///
    /// With no prefix this also removes SWR entries and tag sets, since they
    /// share the root.
    pub async fn flush(&self, prefix: Option<&str>) -> bool {
        let pattern = self.namespace.cache_pattern(prefix);

        let result = async {
            let keys = self.store.keys_matching(&pattern).await?;
            self.store.delete_many(&keys).await
        }
        .await;

        match result {
            Ok(removed) => {
                debug!("Flushed {} keys matching {}", removed, pattern);
                true
            }
            Err(e) => {
                warn!("Cache flush error for {}: {}", pattern, e);
                self.metrics.record_error("cache_manager", &e);
                false
            }
        }
    }

    /// Whether a key is present; `false` when the store is unavailable
    pub async fn exists(&self, key: &str, options: &CacheOptions) -> bool {
        match self.store.exists(&self.key(key, options)).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!("Cache exists error for {}: {}", key, e);
                false
            }
        }
    }

    /// Return the cached value or fetch, store, and return a fresh one
    ///
    /// Fetch errors propagate and nothing is stored. A failure to store the
    /// fetched value is logged and does not affect the result.
    pub async fn with_cache<T, F, Fut>(&self, key: &str, fetch: F, options: &CacheOptions) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(cached) = self.get(key, options).await {
            return Ok(cached);
        }

        let data = fetch().await?;
        self.set(key, &data, options).await;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn manager_with(store: &MemoryStore) -> CacheManager {
        CacheManager::new(
            Arc::new(store.clone()),
            KeyNamespace::default(),
            300,
            Arc::new(CacheMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = MemoryStore::new();
        let cache = manager_with(&store);
        let options = CacheOptions::new().prefix("api");

        assert!(cache.set("countries", &json!(["NZ", "AU"]), &options).await);
        let value: Option<Value> = cache.get("countries", &options).await;
        assert_eq!(value, Some(json!(["NZ", "AU"])));

        assert!(store.exists("obs-explorer:api:countries").await.unwrap());
        assert!(cache.exists("countries", &options).await);
        assert!(!cache.exists("countries", &CacheOptions::new()).await);
    }

    #[tokio::test]
    async fn test_ttl_option_applies() {
        let store = MemoryStore::new();
        let cache = manager_with(&store);

        cache.set("k", &1u32, &CacheOptions::new().ttl(60)).await;
        let ttl = store.ttl("obs-explorer:k").await.unwrap();
        assert!(ttl <= Duration::from_secs(60) && ttl > Duration::from_secs(55));

        cache.set("d", &1u32, &CacheOptions::new()).await;
        assert!(store.ttl("obs-explorer:d").await.unwrap() > Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_del_and_flush() {
        let store = MemoryStore::new();
        let cache = manager_with(&store);
        let api = CacheOptions::new().prefix("api");

        cache.set("a", &1u32, &api).await;
        cache.set("b", &2u32, &api).await;
        cache.set("other", &3u32, &CacheOptions::new()).await;

        assert!(cache.del("a", &api).await);
        assert_eq!(cache.get::<u32>("a", &api).await, None);

        assert!(cache.flush(Some("api")).await);
        assert_eq!(cache.get::<u32>("b", &api).await, None);
        assert_eq!(cache.get::<u32>("other", &CacheOptions::new()).await, Some(3));

        assert!(cache.flush(None).await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_decode_failure_is_a_miss() {
        let store = MemoryStore::new();
        let cache = manager_with(&store);
        store
            .set_with_expiry("obs-explorer:k", b"not json", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(cache.lookup::<Value>("k", &CacheOptions::new()).await.is_degraded());
        assert_eq!(cache.get::<Value>("k", &CacheOptions::new()).await, None);
    }

    #[tokio::test]
    async fn test_with_cache_fetches_once() {
        let store = MemoryStore::new();
        let cache = manager_with(&store);
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let value: Value = cache
                .with_cache(
                    "species:1",
                    || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(json!({"id": 1}))
                    },
                    &CacheOptions::new(),
                )
                .await
                .unwrap();
            assert_eq!(value, json!({"id": 1}));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_cache_degrades_when_store_is_down() {
        let store = MemoryStore::new();
        store.set_available(false);
        let cache = manager_with(&store);
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let value: u32 = cache
                .with_cache(
                    "k",
                    || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(7)
                    },
                    &CacheOptions::new(),
                )
                .await
                .unwrap();
            assert_eq!(value, 7);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!cache.set("k", &1u32, &CacheOptions::new()).await);
        assert!(!cache.flush(None).await);
    }

    #[tokio::test]
    async fn test_with_cache_fetch_error_stores_nothing() {
        let store = MemoryStore::new();
        let cache = manager_with(&store);

        let result: Result<u32> = cache
            .with_cache(
                "k",
                || async { Err(CacheError::upstream("503")) },
                &CacheOptions::new(),
            )
            .await;

        assert!(matches!(result, Err(CacheError::Upstream(_))));
        assert!(store.is_empty().await);
    }
}
