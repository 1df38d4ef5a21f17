//! # Observation Cache (observation-cache)
//!
//! Caching layer for an observation explorer backed by a key-value store.
//!
//! ## Features
//!
//! - Plain JSON cache with TTLs and a read-through `with_cache` helper
//! - Stale-while-revalidate cache with tag and version invalidation
//! - Request deduplication for concurrent identical fetches
//! - Rule-based invalidation with cascades and change detection polling
//! - Priority-ordered, concurrency-capped prefetching
//! - Graceful degradation: a missing or unreachable store turns every read
//!   into a direct upstream fetch
//!
//! ## Stale-while-revalidate
//!
//! ```no_run
//! use observation_cache::{CacheConfig, CacheContext, SwrOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let context = CacheContext::open(CacheConfig::from_env()?)?;
//!
//!     let options = SwrOptions::new()
//!         .prefix("observations")
//!         .ttl(300)
//!         .stale_while_revalidate(3600)
//!         .tags(["observations", "recent"]);
//!
//!     let result = context
//!         .swr()
//!         .get("recent", || async { Ok(json!([{"id": 1}])) }, &options)
//!         .await?;
//!     println!("{:?} (stale: {})", result.data, result.is_stale);
//!
//!     context.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Invalidation
//!
//! ```no_run
//! use observation_cache::{AffectedData, CacheConfig, CacheContext, DataKind};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let context = CacheContext::open(CacheConfig::from_env()?)?;
//!
//!     // Clear observation lists and their dependants
//!     let removed = context
//!         .invalidation()
//!         .invalidate_by_rule("new-observations", None)
//!         .await;
//!     println!("Removed {} entries", removed);
//!
//!     // Let the manager pick rules for a described change
//!     let affected = AffectedData::new(DataKind::Observation)
//!         .with_id(42)
//!         .with_metadata("location", "NL");
//!     context
//!         .invalidation()
//!         .smart_invalidate("observation_update", &affected)
//!         .await;
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod background;
pub mod config;
pub mod context;
pub mod dedupe;
pub mod entry;
pub mod error;
pub mod invalidation;
pub mod manager;
pub mod metrics;
pub mod prefetch;
pub mod source;
pub mod store;
pub mod swr;
pub mod warmer;

// Re-export main types for convenience
pub use background::BackgroundTasks;
pub use config::{CacheConfig, CacheConfigBuilder};
pub use context::CacheContext;
pub use dedupe::{DedupeOptions, RequestDeduplicator};
pub use entry::{CacheEntry, Freshness};
pub use error::{CacheError, Result};
pub use invalidation::{
    AffectedData, ChangeDetectionOptions, ChangeSignal, ChangeSource, DataKind, HttpChangeSource,
    InvalidationManager, InvalidationRule, InvalidationScope, InvalidationStats,
};
pub use manager::{CacheManager, CacheOptions};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use prefetch::{
    ObservationPrefetcher, PrefetchConfig, PrefetchContext, PrefetchManager, PrefetchOptions,
    PrefetchPriority, QueueStatus,
};
pub use source::{ObservationSource, ReferenceList};
pub use store::{KeyNamespace, KeyValueStore, Lookup, MemoryStore, NullStore, RedisStore};
pub use swr::{CacheStatus, SwrCache, SwrOptions, SwrResult, SwrStats};
pub use warmer::{CacheWarmer, WarmReport};
