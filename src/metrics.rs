//! In-process counters for cache behaviour
//!
//! Counters are lock-free except for the labelled maps (errors and
//! invalidations per method), which take a short mutex.

use crate::error::CacheError;
use crate::swr::CacheStatus;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Shared counters, typically held as `Arc<CacheMetrics>`
#[derive(Debug, Default)]
pub struct CacheMetrics {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    swr_fresh: AtomicU64,
    swr_stale: AtomicU64,
    swr_misses: AtomicU64,
    swr_bypassed: AtomicU64,
    revalidations_succeeded: AtomicU64,
    revalidations_failed: AtomicU64,
    dedupe_hits: AtomicU64,
    dedupe_misses: AtomicU64,
    dedupe_timeouts: AtomicU64,
    prefetch_succeeded: AtomicU64,
    prefetch_failed: AtomicU64,
    prefetch_duration_ms: AtomicU64,
    new_data_detections: AtomicU64,
    invalidations: Mutex<BTreeMap<String, InvalidationCount>>,
    errors: Mutex<BTreeMap<String, u64>>,
}

/// Invalidation totals for one method (`tag`, `pattern`, `rule`, `manual`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationCount {
    pub operations: u64,
    pub entries: u64,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub swr_fresh: u64,
    pub swr_stale: u64,
    pub swr_misses: u64,
    pub swr_bypassed: u64,
    pub revalidations_succeeded: u64,
    pub revalidations_failed: u64,
    pub dedupe_hits: u64,
    pub dedupe_misses: u64,
    pub dedupe_timeouts: u64,
    pub prefetch_succeeded: u64,
    pub prefetch_failed: u64,
    pub prefetch_duration_ms: u64,
    pub new_data_detections: u64,
    pub invalidations: BTreeMap<String, InvalidationCount>,
    pub errors: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    /// Fraction of plain cache reads served from the store
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_hit(&self) {
        bump(&self.cache_hits);
    }

    pub fn record_cache_miss(&self) {
        bump(&self.cache_misses);
    }

    /// Record how an SWR read was served
    pub fn record_swr(&self, status: CacheStatus) {
        match status {
            CacheStatus::Fresh => bump(&self.swr_fresh),
            CacheStatus::Stale => bump(&self.swr_stale),
            CacheStatus::Miss => bump(&self.swr_misses),
            CacheStatus::Bypass => bump(&self.swr_bypassed),
        }
    }

    pub fn record_revalidation(&self, success: bool) {
        if success {
            bump(&self.revalidations_succeeded);
        } else {
            bump(&self.revalidations_failed);
        }
    }

    /// `hit` means the caller joined a request already in flight
    pub fn record_dedupe(&self, hit: bool) {
        if hit {
            bump(&self.dedupe_hits);
        } else {
            bump(&self.dedupe_misses);
        }
    }

    pub fn record_dedupe_timeout(&self) {
        bump(&self.dedupe_timeouts);
    }

    pub fn record_prefetch(&self, success: bool, duration: Duration) {
        if success {
            bump(&self.prefetch_succeeded);
        } else {
            bump(&self.prefetch_failed);
        }
        self.prefetch_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_new_data_detection(&self) {
        bump(&self.new_data_detections);
    }

    pub fn record_invalidation(&self, method: &str, entries: usize) {
        let mut invalidations = self.invalidations.lock();
        let count = invalidations.entry(method.to_string()).or_default();
        count.operations += 1;
        count.entries += entries as u64;
    }

    /// Count an error under `<component>:<kind>`
    pub fn record_error(&self, component: &str, error: &CacheError) {
        let label = format!("{}:{}", component, error.kind());
        *self.errors.lock().entry(label).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        MetricsSnapshot {
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            swr_fresh: load(&self.swr_fresh),
            swr_stale: load(&self.swr_stale),
            swr_misses: load(&self.swr_misses),
            swr_bypassed: load(&self.swr_bypassed),
            revalidations_succeeded: load(&self.revalidations_succeeded),
            revalidations_failed: load(&self.revalidations_failed),
            dedupe_hits: load(&self.dedupe_hits),
            dedupe_misses: load(&self.dedupe_misses),
            dedupe_timeouts: load(&self.dedupe_timeouts),
            prefetch_succeeded: load(&self.prefetch_succeeded),
            prefetch_failed: load(&self.prefetch_failed),
            prefetch_duration_ms: load(&self.prefetch_duration_ms),
            new_data_detections: load(&self.new_data_detections),
            invalidations: self.invalidations.lock().clone(),
            errors: self.errors.lock().clone(),
        }
    }
}
