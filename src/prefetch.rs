//! Priority-ordered background prefetching
//!
//! [`PrefetchManager`] keeps one FIFO lane per priority and runs at most
//! `max_concurrent` fetches at a time. When the cap is hit, the queue is
//! drained again after a short delay instead of spinning. A key that is
//! already queued or running is not queued twice.
//!
//! [`ObservationPrefetcher`] layers the observation-specific helpers on top:
//! it decides what to prefetch for a page and stores results through the
//! plain cache under the `api` prefix.

use crate::background::{BackgroundTasks, KeyGuard, KeySet};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::manager::{CacheManager, CacheOptions};
use crate::metrics::CacheMetrics;
use crate::source::{parse_id, ObservationSource};
use futures::future::BoxFuture;
use futures::{FutureExt, TryFutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Prefix under which prefetched responses are cached
pub const API_PREFIX: &str = "api";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefetchPriority {
    High,
    #[default]
    Medium,
    Low,
}

impl PrefetchPriority {
    fn lane(self) -> usize {
        match self {
            PrefetchPriority::High => 0,
            PrefetchPriority::Medium => 1,
            PrefetchPriority::Low => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PrefetchOptions {
    pub priority: PrefetchPriority,
    /// Log outcomes at debug level only
    pub silent: bool,
}

impl Default for PrefetchOptions {
    fn default() -> Self {
        Self {
            priority: PrefetchPriority::Medium,
            silent: true,
        }
    }
}

impl PrefetchOptions {
    pub fn priority(mut self, priority: PrefetchPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }
}

/// Scheduling limits for a [`PrefetchManager`]
#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    pub max_concurrent: usize,
    pub reschedule_delay: Duration,
    pub task_timeout: Duration,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            reschedule_delay: Duration::from_millis(100),
            task_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&CacheConfig> for PrefetchConfig {
    fn from(config: &CacheConfig) -> Self {
        Self {
            max_concurrent: config.prefetch_max_concurrent,
            reschedule_delay: config.prefetch_reschedule_delay,
            task_timeout: config.background_task_timeout,
        }
    }
}

/// Snapshot returned by [`PrefetchManager::get_queue_status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queue_length: usize,
    pub active_prefetches: usize,
    /// Prefetches are running or a queue drain is scheduled
    pub is_processing: bool,
}

type PrefetchFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct QueuedPrefetch {
    key: String,
    priority: PrefetchPriority,
    silent: bool,
    fetch: PrefetchFn,
}

#[derive(Default)]
struct PrefetchQueue {
    lanes: [VecDeque<QueuedPrefetch>; 3],
    reschedule_pending: bool,
}

impl PrefetchQueue {
    fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    fn contains(&self, key: &str) -> bool {
        self.lanes.iter().flatten().any(|task| task.key == key)
    }

    fn push(&mut self, task: QueuedPrefetch) {
        self.lanes[task.priority.lane()].push_back(task);
    }

    fn pop(&mut self) -> Option<QueuedPrefetch> {
        self.lanes.iter_mut().find_map(VecDeque::pop_front)
    }

    fn clear(&mut self) -> usize {
        let dropped = self.len();
        self.lanes.iter_mut().for_each(VecDeque::clear);
        dropped
    }
}

struct Inner {
    queue: Mutex<PrefetchQueue>,
    active: KeySet,
    tasks: BackgroundTasks,
    metrics: Arc<CacheMetrics>,
    config: PrefetchConfig,
}

/// Bounded, priority-ordered prefetch queue
///
/// Clones share the queue. Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct PrefetchManager {
    inner: Arc<Inner>,
}

impl PrefetchManager {
    pub fn new(tasks: BackgroundTasks, metrics: Arc<CacheMetrics>, config: PrefetchConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(PrefetchQueue::default()),
                active: KeySet::default(),
                tasks,
                metrics,
                config,
            }),
        }
    }

    /// Queue `fetch` under `key`
    ///
    /// Returns `false` without queueing when `key` is already queued or
    /// running. The fetched value is discarded; fetch functions store what
    /// they want to keep.
    pub fn prefetch<T, F, Fut>(&self, key: impl Into<String>, fetch: F, options: &PrefetchOptions) -> bool
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let key = key.into();

        {
            let mut queue = self.inner.queue.lock();
            if queue.contains(&key) || self.inner.active.lock().contains(&key) {
                debug!("Prefetch already pending: {}", key);
                return false;
            }

            queue.push(QueuedPrefetch {
                key,
                priority: options.priority,
                silent: options.silent,
                fetch: Box::new(move || fetch().map_ok(|_| ()).boxed()),
            });
        }

        self.process_queue();
        true
    }

    /// Start queued prefetches up to the concurrency cap
    fn process_queue(&self) {
        let mut queue = self.inner.queue.lock();

        while self.inner.active.lock().len() < self.inner.config.max_concurrent {
            let Some(task) = queue.pop() else {
                break;
            };
            let Some(slot) = KeyGuard::try_claim(&self.inner.active, &task.key) else {
                continue;
            };
            self.dispatch(task, slot);
        }

        if !queue.is_empty() && !queue.reschedule_pending {
            queue.reschedule_pending = true;
            let manager = self.clone();
            let delay = self.inner.config.reschedule_delay;

            self.inner.tasks.spawn(async move {
                tokio::time::sleep(delay).await;
                manager.inner.queue.lock().reschedule_pending = false;
                manager.process_queue();
            });
        }
    }

    fn dispatch(&self, task: QueuedPrefetch, slot: KeyGuard) {
        let metrics = Arc::clone(&self.inner.metrics);
        let timeout = self.inner.config.task_timeout;

        if !task.silent {
            info!("Prefetching [{:?}]: {}", task.priority, task.key);
        }

        self.inner.tasks.spawn(async move {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(timeout, (task.fetch)()).await {
                Ok(result) => result,
                Err(_) => Err(CacheError::Other(format!(
                    "Prefetch timed out after {:?}",
                    timeout
                ))),
            };
            let elapsed = started.elapsed();
            metrics.record_prefetch(outcome.is_ok(), elapsed);

            match outcome {
                Ok(()) if task.silent => debug!("Prefetch completed: {} ({:?})", slot.key(), elapsed),
                Ok(()) => info!("Prefetch completed: {} ({:?})", slot.key(), elapsed),
                Err(e) if task.silent => {
                    debug!("Prefetch failed: {} ({:?}): {}", slot.key(), elapsed, e)
                }
                Err(e) => warn!("Prefetch failed: {} ({:?}): {}", slot.key(), elapsed, e),
            }
        });
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        let queue = self.inner.queue.lock();
        let active = self.inner.active.lock().len();
        QueueStatus {
            queue_length: queue.len(),
            active_prefetches: active,
            is_processing: active > 0 || queue.reschedule_pending,
        }
    }

    /// Drop every queued prefetch; running ones finish normally
    pub fn clear_queue(&self) -> usize {
        let dropped = self.inner.queue.lock().clear();
        if dropped > 0 {
            info!("Cleared {} queued prefetches", dropped);
        }
        dropped
    }

    /// Wait until every background task, prefetches included, has finished
    pub async fn wait_idle(&self) {
        self.inner.tasks.wait_idle().await;
    }
}

/// Page the user is looking at, used by [`ObservationPrefetcher::smart_prefetch`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrefetchContext {
    pub page: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub user_id: Option<i64>,
}

impl PrefetchContext {
    pub fn new(page: impl Into<String>) -> Self {
        Self {
            page: page.into(),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

/// Prefetch helpers for observation pages
///
/// Each helper caps how many items a single call may queue so one page view
/// cannot flood the queue.
#[derive(Clone)]
pub struct ObservationPrefetcher {
    manager: PrefetchManager,
    source: Arc<dyn ObservationSource>,
    cache: Arc<CacheManager>,
}

impl ObservationPrefetcher {
    pub const MAX_OBSERVATIONS: usize = 5;
    pub const MAX_SPECIES: usize = 10;
    pub const MAX_FOLLOW_UP_SPECIES: usize = 5;
    pub const USER_RECENT_LIMIT: usize = 10;
    pub const SPECIES_OBSERVATIONS_LIMIT: usize = 5;

    pub fn new(manager: PrefetchManager, source: Arc<dyn ObservationSource>, cache: Arc<CacheManager>) -> Self {
        Self {
            manager,
            source,
            cache,
        }
    }

    pub fn manager(&self) -> &PrefetchManager {
        &self.manager
    }

    /// Queue a fetch whose result is cached under `key`
    fn queue<F, Fut>(&self, key: String, fetch: F, options: &PrefetchOptions) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let cache = Arc::clone(&self.cache);
        let cache_key = key.clone();

        self.manager.prefetch(
            key,
            move || async move {
                let value = fetch().await?;
                cache
                    .set(&cache_key, &value, &CacheOptions::new().prefix(API_PREFIX))
                    .await;
                Ok(value)
            },
            options,
        )
    }

    /// Queue the first five observations at medium priority
    ///
    /// Returns the number of prefetches queued.
    pub fn prefetch_observation_details(&self, ids: &[Value], options: &PrefetchOptions) -> usize {
        let options = options.clone().priority(PrefetchPriority::Medium);
        let mut queued = 0;

        for id in ids.iter().take(Self::MAX_OBSERVATIONS).filter_map(parse_id) {
            let source = Arc::clone(&self.source);
            let fetch = move || async move { source.observation(id).await };
            if self.queue(format!("observation:{}", id), fetch, &options) {
                queued += 1;
            }
        }

        queued
    }

    /// Queue the first ten species at low priority
    pub fn prefetch_species_details(&self, ids: &[Value], options: &PrefetchOptions) -> usize {
        let options = options.clone().priority(PrefetchPriority::Low);
        let mut queued = 0;

        for id in ids.iter().take(Self::MAX_SPECIES).filter_map(parse_id) {
            let source = Arc::clone(&self.source);
            let fetch = move || async move { source.species(id).await };
            if self.queue(format!("species:{}", id), fetch, &options) {
                queued += 1;
            }
        }

        queued
    }

    /// Queue a user's recent observations at high priority
    ///
    /// Once they arrive, the species of the first few are queued as well.
    pub fn prefetch_user_recent_data(&self, user_id: Option<i64>, options: &PrefetchOptions) -> bool {
        let Some(user_id) = user_id else {
            return false;
        };

        let prefetcher = self.clone();
        let follow_up = options.clone();
        let fetch = move || async move {
            let observations = prefetcher
                .source
                .user_observations(user_id, Self::USER_RECENT_LIMIT)
                .await?;

            let species = species_ids(&observations, Self::MAX_FOLLOW_UP_SPECIES);
            if !species.is_empty() {
                prefetcher.prefetch_species_details(&species, &follow_up);
            }

            Ok(observations)
        };

        let options = options.clone().priority(PrefetchPriority::High);
        self.queue(format!("user:{}:recent", user_id), fetch, &options)
    }

    /// Queue recent observations of one species at medium priority
    pub fn prefetch_species_observations(&self, species_id: i64, options: &PrefetchOptions) -> bool {
        let source = Arc::clone(&self.source);
        let fetch = move || async move {
            source
                .species_observations(species_id, Self::SPECIES_OBSERVATIONS_LIMIT)
                .await
        };

        let options = options.clone().priority(PrefetchPriority::Medium);
        self.queue(format!("species:{}:observations", species_id), fetch, &options)
    }

    /// Queue whatever the given page is likely to need next
    ///
    /// Returns the number of prefetches queued; unknown pages queue nothing.
    pub fn smart_prefetch(&self, context: &PrefetchContext) -> usize {
        let options = PrefetchOptions::default();
        let data = context.data.as_ref();

        match context.page.as_str() {
            "observations" => {
                let ids = result_ids(data, Self::MAX_OBSERVATIONS);
                self.prefetch_observation_details(&ids, &options)
            }
            "species" => {
                let ids = result_ids(data, Self::MAX_SPECIES);
                self.prefetch_species_details(&ids, &options)
            }
            "dashboard" | "home" => {
                usize::from(self.prefetch_user_recent_data(context.user_id, &options))
            }
            "observation-detail" => match data.and_then(|d| d.get("species")) {
                Some(species) if !species.is_null() => {
                    self.prefetch_species_details(std::slice::from_ref(species), &options)
                }
                _ => 0,
            },
            "species-detail" => match data.and_then(|d| d.get("id")).and_then(parse_id) {
                Some(id) => usize::from(self.prefetch_species_observations(id, &options)),
                None => 0,
            },
            other => {
                debug!("No prefetch strategy for page: {}", other);
                0
            }
        }
    }
}

/// Ids of the first `limit` entries of a `{ "results": [...] }` page
fn result_ids(data: Option<&Value>, limit: usize) -> Vec<Value> {
    data.and_then(|d| d.get("results"))
        .and_then(Value::as_array)
        .map(|results| {
            results
                .iter()
                .take(limit)
                .filter_map(|r| r.get("id").cloned())
                .collect()
        })
        .unwrap_or_default()
}

/// Numeric species ids referenced by a page of observations
fn species_ids(observations: &Value, limit: usize) -> Vec<Value> {
    observations
        .get("results")
        .and_then(Value::as_array)
        .map(|results| {
            results
                .iter()
                .filter_map(|o| o.get("species"))
                .filter(|s| s.is_number())
                .take(limit)
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}
