//! Stale-while-revalidate cache
//!
//! Entries are served in three regimes. A fresh entry is returned as is. A
//! stale entry is returned immediately while at most one background task per
//! key refreshes it. A missing or expired entry is fetched inline and stored.
//!
//! Entries may carry tags (indexed in `<root>:tags:<tag>` sets) and a version
//! string, both usable for bulk invalidation.

use crate::background::{BackgroundTasks, KeyGuard, KeySet};
use crate::entry::{CacheEntry, EntryHeader, Freshness};
use crate::error::{CacheError, Result};
use crate::metrics::CacheMetrics;
use crate::store::{KeyNamespace, KeyValueStore, Lookup};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How a [`SwrResult`] was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    /// Served from a fresh entry
    Fresh,
    /// Served from a stale entry
    Stale,
    /// Fetched because no usable entry existed
    Miss,
    /// Fetched directly because the store was unavailable
    Bypass,
}

/// Per-call options for [`SwrCache`]
#[derive(Debug, Clone)]
pub struct SwrOptions {
    /// Freshness window in seconds
    pub ttl: Option<u64>,
    /// Stale window in seconds
    pub stale_while_revalidate: Option<u64>,
    pub prefix: Option<String>,
    pub tags: Vec<String>,
    pub version: Option<String>,
    /// Whether stale reads start a background refresh
    pub background: bool,
}

impl Default for SwrOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            stale_while_revalidate: None,
            prefix: None,
            tags: Vec::new(),
            version: None,
            background: true,
        }
    }
}

impl SwrOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn stale_while_revalidate(mut self, window: u64) -> Self {
        self.stale_while_revalidate = Some(window);
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }
}

/// Value returned by [`SwrCache::get`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwrResult<T> {
    pub data: T,
    pub is_stale: bool,
    pub is_fresh: bool,
    /// True only for the read that started a background refresh
    pub revalidating: bool,
    pub status: CacheStatus,
}

impl<T> SwrResult<T> {
    fn fresh(data: T, status: CacheStatus) -> Self {
        Self {
            data,
            is_stale: false,
            is_fresh: true,
            revalidating: false,
            status,
        }
    }

    fn stale(data: T, revalidating: bool) -> Self {
        Self {
            data,
            is_stale: true,
            is_fresh: false,
            revalidating,
            status: CacheStatus::Stale,
        }
    }
}

/// Entry counts by freshness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwrStats {
    pub total_entries: usize,
    pub fresh_entries: usize,
    pub stale_entries: usize,
    pub expired_entries: usize,
}

/// Stale-while-revalidate cache over a [`KeyValueStore`]
///
/// Cloning is cheap and clones share the store, the revalidation guard set,
/// and the background task registry.
#[derive(Clone)]
pub struct SwrCache {
    store: Arc<dyn KeyValueStore>,
    namespace: KeyNamespace,
    default_ttl: u64,
    default_swr: u64,
    tag_ttl: Duration,
    task_timeout: Duration,
    revalidating: KeySet,
    tasks: BackgroundTasks,
    metrics: Arc<CacheMetrics>,
}

impl SwrCache {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        namespace: KeyNamespace,
        metrics: Arc<CacheMetrics>,
        tasks: BackgroundTasks,
    ) -> Self {
        Self {
            store,
            namespace,
            default_ttl: 300,
            default_swr: 3600,
            tag_ttl: Duration::from_secs(86_400),
            task_timeout: Duration::from_secs(30),
            revalidating: KeySet::default(),
            tasks,
            metrics,
        }
    }

    /// Override the default windows (seconds) used when options omit them
    pub fn with_defaults(mut self, ttl: u64, stale_while_revalidate: u64) -> Self {
        self.default_ttl = ttl;
        self.default_swr = stale_while_revalidate;
        self
    }

    pub fn with_tag_ttl(mut self, tag_ttl: Duration) -> Self {
        self.tag_ttl = tag_ttl;
        self
    }

    /// Upper bound for a background refresh
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    /// Keys with a background refresh in progress
    pub fn revalidating_keys(&self) -> Vec<String> {
        self.revalidating.lock().iter().cloned().collect()
    }

    async fn lookup<T: DeserializeOwned>(&self, cache_key: &str) -> Lookup<CacheEntry<T>> {
        match self.store.get(cache_key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(entry) => Lookup::Hit(entry),
                Err(e) => {
                    debug!("Unreadable SWR entry {}, treating as miss: {}", cache_key, e);
                    Lookup::Miss
                }
            },
            Ok(None) => Lookup::Miss,
            Err(e) => Lookup::Degraded(e),
        }
    }

    /// Read `key`, serving cached data according to its freshness
    ///
    /// Fetch errors on the miss path propagate and nothing is stored. When
    /// the store is unavailable the fetch runs directly and its result is
    /// reported as fresh with status [`CacheStatus::Bypass`].
    pub async fn get<T, F, Fut>(&self, key: &str, fetch: F, options: &SwrOptions) -> Result<SwrResult<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let started = Instant::now();
        let cache_key = self.namespace.swr_key(key, options.prefix.as_deref());

        match self.lookup::<T>(&cache_key).await {
            Lookup::Degraded(e) => {
                warn!("SWR cache error for {}, fetching directly: {}", cache_key, e);
                self.metrics.record_error("swr", &e);
                self.metrics.record_swr(CacheStatus::Bypass);
                let data = fetch().await?;
                return Ok(SwrResult::fresh(data, CacheStatus::Bypass));
            }
            Lookup::Hit(entry) => match entry.freshness() {
                Freshness::Fresh => {
                    debug!("SWR fresh: {} ({:?})", cache_key, started.elapsed());
                    self.metrics.record_swr(CacheStatus::Fresh);
                    return Ok(SwrResult::fresh(entry.data, CacheStatus::Fresh));
                }
                Freshness::Stale => {
                    debug!("SWR stale: {} ({:?})", cache_key, started.elapsed());
                    self.metrics.record_swr(CacheStatus::Stale);
                    let revalidating =
                        options.background && self.revalidate_in_background(&cache_key, key, fetch, options);
                    return Ok(SwrResult::stale(entry.data, revalidating));
                }
                Freshness::Expired => {}
            },
            Lookup::Miss => {}
        }

        debug!("SWR miss: {}", cache_key);
        self.metrics.record_swr(CacheStatus::Miss);
        let data = fetch().await?;
        self.set(key, &data, options).await;
        Ok(SwrResult::fresh(data, CacheStatus::Miss))
    }

    /// Start a refresh of `cache_key` unless one is already running
    fn revalidate_in_background<T, F, Fut>(
        &self,
        cache_key: &str,
        key: &str,
        fetch: F,
        options: &SwrOptions,
    ) -> bool
    where
        T: Serialize + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let Some(guard) = KeyGuard::try_claim(&self.revalidating, cache_key) else {
            debug!("Revalidation already running for {}", cache_key);
            return false;
        };

        let cache = self.clone();
        let key = key.to_string();
        let options = options.clone();

        self.tasks.spawn(async move {
            debug!("SWR revalidating: {}", guard.key());

            match tokio::time::timeout(cache.task_timeout, fetch()).await {
                Ok(Ok(data)) => {
                    cache.set(&key, &data, &options).await;
                    cache.metrics.record_revalidation(true);
                    debug!("SWR revalidated: {}", guard.key());
                }
                Ok(Err(e)) => {
                    warn!("SWR revalidation failed for {}: {}", guard.key(), e);
                    cache.metrics.record_revalidation(false);
                    cache.metrics.record_error("swr_revalidation", &e);
                }
                Err(_) => {
                    warn!(
                        "SWR revalidation for {} timed out after {:?}",
                        guard.key(),
                        cache.task_timeout
                    );
                    cache.metrics.record_revalidation(false);
                }
            }
        });

        true
    }

    async fn try_set<T: Serialize + ?Sized>(&self, key: &str, value: &T, options: &SwrOptions) -> Result<String> {
        let ttl = options.ttl.unwrap_or(self.default_ttl);
        let swr = options.stale_while_revalidate.unwrap_or(self.default_swr);
        let cache_key = self.namespace.swr_key(key, options.prefix.as_deref());

        let entry = CacheEntry::new(value, ttl, swr)
            .with_tags(options.tags.iter().cloned())
            .with_version(options.version.clone());
        let bytes = serde_json::to_vec(&entry)?;

        self.store
            .set_with_expiry(&cache_key, &bytes, Duration::from_secs(entry.total_ttl()))
            .await?;
        debug!("SWR set: {} (ttl: {}s, swr: {}s)", cache_key, ttl, swr);

        Ok(cache_key)
    }

    async fn index_tags(&self, cache_key: &str, tags: &[String]) -> Result<()> {
        for tag in tags {
            let tag_key = self.namespace.tag_key(tag);
            self.store.add_to_set(&tag_key, cache_key).await?;
            self.store.expire(&tag_key, self.tag_ttl).await?;
        }
        Ok(())
    }

    /// Store `value` under `key`; returns whether the entry was written
    ///
    /// A failure to index tags is logged but still counts as written.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, options: &SwrOptions) -> bool {
        let cache_key = match self.try_set(key, value, options).await {
            Ok(cache_key) => cache_key,
            Err(e) => {
                warn!("SWR cache set error for {}: {}", key, e);
                self.metrics.record_error("swr", &e);
                return false;
            }
        };

        if let Err(e) = self.index_tags(&cache_key, &options.tags).await {
            warn!("Error setting cache tags for {}: {}", cache_key, e);
            self.metrics.record_error("swr_tags", &e);
        }

        true
    }

    /// Delete every entry indexed under `tag` along with the tag set
    ///
    /// Returns the number of entries actually removed, so a repeated call
    /// returns 0.
    pub async fn try_invalidate_by_tag(&self, tag: &str) -> Result<usize> {
        let tag_key = self.namespace.tag_key(tag);
        let members = self.store.members_of(&tag_key).await?;

        if members.is_empty() {
            debug!("No cache entries found for tag: {}", tag);
            return Ok(0);
        }

        let removed = self.store.delete_many(&members).await?;
        self.store.delete(&tag_key).await?;
        info!("Invalidated {} cache entries with tag: {}", removed, tag);

        Ok(removed)
    }

    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        match self.try_invalidate_by_tag(tag).await {
            Ok(removed) => {
                self.metrics.record_invalidation("tag", removed);
                removed
            }
            Err(e) => {
                warn!("Error invalidating tag {}: {}", tag, e);
                self.metrics.record_error("tag_invalidation", &e);
                0
            }
        }
    }

    async fn headers(&self, prefix: Option<&str>) -> Result<Vec<(String, Option<EntryHeader>)>> {
        let keys = self.store.keys_matching(&self.namespace.swr_pattern(prefix)).await?;
        let mut headers = Vec::with_capacity(keys.len());

        for key in keys {
            let header = match self.store.get(&key).await? {
                Some(bytes) => Some(serde_json::from_slice::<EntryHeader>(&bytes).ok()),
                None => None,
            };
            // Outer None: key vanished between the scan and the read
            if let Some(header) = header {
                headers.push((key, header));
            }
        }

        Ok(headers)
    }

    /// Delete entries under `prefix` whose version equals `version`
    pub async fn invalidate_by_version(&self, version: &str, prefix: Option<&str>) -> usize {
        let result = async {
            let mut removed = 0;
            for (key, header) in self.headers(prefix).await? {
                let matches = header.map_or(false, |h| h.version.as_deref() == Some(version));
                if matches && self.store.delete(&key).await? {
                    removed += 1;
                }
            }
            Ok::<_, CacheError>(removed)
        }
        .await;

        match result {
            Ok(removed) => {
                info!("Invalidated {} cache entries with version: {}", removed, version);
                self.metrics.record_invalidation("version", removed);
                removed
            }
            Err(e) => {
                warn!("Error invalidating version {}: {}", version, e);
                self.metrics.record_error("version_invalidation", &e);
                0
            }
        }
    }

    /// Delete a single entry; returns whether the command succeeded
    pub async fn delete(&self, key: &str, prefix: Option<&str>) -> bool {
        let cache_key = self.namespace.swr_key(key, prefix);
        match self.store.delete(&cache_key).await {
            Ok(_) => {
                debug!("SWR delete: {}", cache_key);
                true
            }
            Err(e) => {
                warn!("SWR cache delete error for {}: {}", cache_key, e);
                false
            }
        }
    }

    /// Delete every entry under `prefix`, or every SWR entry when `None`
    pub async fn try_clear(&self, prefix: Option<&str>) -> Result<usize> {
        let keys = self
            .store
            .keys_matching(&self.namespace.swr_pattern(prefix))
            .await?;
        let removed = self.store.delete_many(&keys).await?;
        info!(
            "SWR clear: {} entries (prefix: {})",
            removed,
            prefix.unwrap_or("all")
        );
        Ok(removed)
    }

    pub async fn clear(&self, prefix: Option<&str>) -> usize {
        match self.try_clear(prefix).await {
            Ok(removed) => {
                self.metrics.record_invalidation("pattern", removed);
                removed
            }
            Err(e) => {
                warn!("SWR cache clear error: {}", e);
                self.metrics.record_error("swr_clear", &e);
                0
            }
        }
    }

    /// Count entries under `prefix` by freshness
    ///
    /// Unreadable entries count as expired. Returns zeros when the store is
    /// unavailable.
    pub async fn get_stats(&self, prefix: Option<&str>) -> SwrStats {
        let headers = match self.headers(prefix).await {
            Ok(headers) => headers,
            Err(e) => {
                warn!("Error getting cache stats: {}", e);
                return SwrStats::default();
            }
        };

        let now = crate::entry::now_millis();
        let mut stats = SwrStats {
            total_entries: headers.len(),
            ..Default::default()
        };

        for (_, header) in headers {
            match header.map(|h| h.freshness_at(now)) {
                Some(Freshness::Fresh) => stats.fresh_entries += 1,
                Some(Freshness::Stale) => stats.stale_entries += 1,
                Some(Freshness::Expired) | None => stats.expired_entries += 1,
            }
        }

        stats
    }
}
