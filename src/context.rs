//! Service wiring
//!
//! [`CacheContext`] builds every cache service from one [`CacheConfig`] and
//! hands them out by `Arc`. All services share the same store, metrics, and
//! background task registry.

use crate::background::BackgroundTasks;
use crate::config::CacheConfig;
use crate::dedupe::RequestDeduplicator;
use crate::error::Result;
use crate::invalidation::{ChangeDetectionOptions, ChangeSource, HttpChangeSource, InvalidationManager};
use crate::manager::CacheManager;
use crate::metrics::CacheMetrics;
use crate::prefetch::{ObservationPrefetcher, PrefetchConfig, PrefetchManager};
use crate::source::ObservationSource;
use crate::store::{KeyNamespace, KeyValueStore, NullStore, RedisStore};
use crate::swr::SwrCache;
use crate::warmer::CacheWarmer;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Every cache service, constructed once per process
pub struct CacheContext {
    config: CacheConfig,
    store: Arc<dyn KeyValueStore>,
    metrics: Arc<CacheMetrics>,
    tasks: BackgroundTasks,
    cache: Arc<CacheManager>,
    swr: Arc<SwrCache>,
    dedupe: RequestDeduplicator<Value>,
    invalidation: Arc<InvalidationManager>,
    prefetch: PrefetchManager,
}

impl CacheContext {
    /// Build the services for `config`
    ///
    /// Uses Redis when `redis_url` is set and a null store otherwise. The
    /// Redis connection is opened lazily, so an unreachable server does not
    /// fail here.
    pub fn open(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn KeyValueStore> = match config.redis_url.as_deref() {
            Some(url) => Arc::new(RedisStore::new(
                url,
                config.connect_timeout,
                config.command_timeout,
            )?),
            None => {
                warn!("No key-value store configured, every read goes upstream");
                Arc::new(NullStore)
            }
        };

        let change_source = Arc::new(HttpChangeSource::new(
            config.change_detection_base_url.clone(),
            config.background_task_timeout,
        )?);

        Ok(Self::with_store(config, store, change_source))
    }

    /// Build the services over an explicit store and change source
    pub fn with_store(
        config: CacheConfig,
        store: Arc<dyn KeyValueStore>,
        change_source: Arc<dyn ChangeSource>,
    ) -> Self {
        let metrics = Arc::new(CacheMetrics::new());
        let tasks = BackgroundTasks::new();
        let namespace = KeyNamespace::new(config.namespace.clone());

        let cache = Arc::new(CacheManager::new(
            Arc::clone(&store),
            namespace.clone(),
            config.default_ttl_secs(),
            Arc::clone(&metrics),
        ));

        let swr = Arc::new(
            SwrCache::new(Arc::clone(&store), namespace, Arc::clone(&metrics), tasks.clone())
                .with_defaults(config.default_ttl_secs(), config.default_swr_secs())
                .with_tag_ttl(config.tag_ttl)
                .with_task_timeout(config.background_task_timeout),
        );

        let dedupe = RequestDeduplicator::new(Arc::clone(&metrics))
            .with_default_timeout(config.dedupe_timeout);

        let invalidation = Arc::new(
            InvalidationManager::new(Arc::clone(&swr), change_source, Arc::clone(&metrics))
                .with_last_checked_capacity(config.max_last_checked),
        );

        let prefetch = PrefetchManager::new(
            tasks.clone(),
            Arc::clone(&metrics),
            PrefetchConfig::from(&config),
        );

        info!(
            "Cache services ready (store: {}, namespace: {})",
            store.backend(),
            config.namespace
        );

        Self {
            config,
            store,
            metrics,
            tasks,
            cache,
            swr,
            dedupe,
            invalidation,
            prefetch,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn swr(&self) -> &Arc<SwrCache> {
        &self.swr
    }

    pub fn dedupe(&self) -> &RequestDeduplicator<Value> {
        &self.dedupe
    }

    pub fn invalidation(&self) -> &Arc<InvalidationManager> {
        &self.invalidation
    }

    pub fn prefetch(&self) -> &PrefetchManager {
        &self.prefetch
    }

    /// Observation prefetch helpers over `source`
    pub fn prefetcher(&self, source: Arc<dyn ObservationSource>) -> ObservationPrefetcher {
        ObservationPrefetcher::new(self.prefetch.clone(), source, Arc::clone(&self.cache))
    }

    pub fn warmer(&self, source: Arc<dyn ObservationSource>) -> CacheWarmer {
        CacheWarmer::new(Arc::clone(&self.cache), source)
    }

    /// Start change detection with the configured interval and default endpoints
    pub fn start_change_detection(&self) -> bool {
        self.invalidation.start_change_detection(ChangeDetectionOptions {
            check_interval: self.config.change_detection_interval,
            ..Default::default()
        })
    }

    /// Stop background work and release the store
    ///
    /// Queued prefetches are dropped; running tasks get up to the background
    /// task timeout to finish.
    pub async fn close(&self) {
        self.invalidation.stop_change_detection();
        self.prefetch.clear_queue();

        if !self
            .tasks
            .wait_idle_timeout(self.config.background_task_timeout)
            .await
        {
            warn!(
                "{} background tasks still running at shutdown",
                self.tasks.outstanding()
            );
        }

        self.store.close().await;
        info!("Cache services closed");
    }
}
