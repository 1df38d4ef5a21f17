//! Cache warming for static reference data
//!
//! Warming never fails as a whole: every list or species that cannot be
//! fetched or stored is logged and reported in the [`WarmReport`].

use crate::manager::{CacheManager, CacheOptions};
use crate::prefetch::API_PREFIX;
use crate::source::{ObservationSource, ReferenceList};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Species warmed when no explicit list is given
pub const DEFAULT_POPULAR_SPECIES: [i64; 10] = [1, 2, 3, 4, 5, 10, 20, 30, 40, 50];

/// TTL in seconds for warmed species
pub const POPULAR_SPECIES_TTL: u64 = 14_400;

/// Outcome of a warming run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmReport {
    /// Cache keys written
    pub warmed: Vec<String>,
    /// Cache keys that could not be fetched or stored
    pub failed: Vec<String>,
    pub duration_ms: u64,
}

impl WarmReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, key: String, ok: bool) {
        if ok {
            self.warmed.push(key);
        } else {
            self.failed.push(key);
        }
    }
}

/// Fills the plain cache with reference lists and popular species
pub struct CacheWarmer {
    cache: Arc<CacheManager>,
    source: Arc<dyn ObservationSource>,
    authenticated: bool,
}

impl CacheWarmer {
    pub fn new(cache: Arc<CacheManager>, source: Arc<dyn ObservationSource>) -> Self {
        Self {
            cache,
            source,
            authenticated: false,
        }
    }

    /// Whether the upstream client is authenticated; challenges are only
    /// warmed when it is
    pub fn authenticated(mut self, authenticated: bool) -> Self {
        self.authenticated = authenticated;
        self
    }

    /// Lists this warmer will fetch
    pub fn lists(&self) -> Vec<ReferenceList> {
        ReferenceList::ALL
            .into_iter()
            .filter(|list| self.authenticated || !list.requires_auth())
            .collect()
    }

    async fn warm_list(&self, list: ReferenceList) -> bool {
        let response = match self.source.reference_list(list).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Failed to fetch {} for warming: {}", list.cache_key(), e);
                return false;
            }
        };

        let options = CacheOptions::new().ttl(list.ttl_secs()).prefix(API_PREFIX);
        self.cache
            .set(list.cache_key(), &list.normalize(response), &options)
            .await
    }

    /// Warm every static reference list concurrently
    pub async fn warm_cache(&self) -> WarmReport {
        info!("Warming cache...");
        let started = Instant::now();

        let lists = self.lists();
        let outcomes = join_all(lists.iter().map(|&list| self.warm_list(list))).await;

        let mut report = WarmReport::default();
        for (list, ok) in lists.into_iter().zip(outcomes) {
            report.record(list.cache_key().to_string(), ok);
        }
        report.duration_ms = started.elapsed().as_millis() as u64;

        if report.is_complete() {
            info!("Cache warming complete ({}ms)", report.duration_ms);
        } else {
            error!("Cache warming failed for: {}", report.failed.join(", "));
        }
        report
    }

    async fn warm_species(&self, species_id: i64) -> bool {
        let key = format!("species:{}", species_id);
        match self.source.species(species_id).await {
            Ok(species) => {
                let options = CacheOptions::new().ttl(POPULAR_SPECIES_TTL).prefix(API_PREFIX);
                self.cache.set(&key, &species, &options).await
            }
            Err(e) => {
                warn!("Failed to fetch species {} for warming: {}", species_id, e);
                false
            }
        }
    }

    /// Warm the given species, or [`DEFAULT_POPULAR_SPECIES`] when empty
    pub async fn warm_popular_species(&self, species_ids: &[i64]) -> WarmReport {
        let started = Instant::now();
        let ids: &[i64] = if species_ids.is_empty() {
            &DEFAULT_POPULAR_SPECIES
        } else {
            species_ids
        };

        let outcomes = join_all(ids.iter().map(|&id| self.warm_species(id))).await;

        let mut report = WarmReport::default();
        for (id, ok) in ids.iter().zip(outcomes) {
            report.record(format!("species:{}", id), ok);
        }
        report.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            "Warmed {} popular species ({} failed)",
            report.warmed.len(),
            report.failed.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CacheError, Result};
    use crate::metrics::CacheMetrics;
    use crate::store::{KeyNamespace, KeyValueStore, MemoryStore};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    struct ReferenceSource;

    #[async_trait]
    impl ObservationSource for ReferenceSource {
        async fn observation(&self, id: i64) -> Result<Value> {
            Ok(json!({"id": id}))
        }

        async fn species(&self, id: i64) -> Result<Value> {
            if id == 3 {
                Err(CacheError::upstream("404"))
            } else {
                Ok(json!({"id": id}))
            }
        }

        async fn user_observations(&self, _user_id: i64, _limit: usize) -> Result<Value> {
            Ok(json!({"results": []}))
        }

        async fn species_observations(&self, _species_id: i64, _limit: usize) -> Result<Value> {
            Ok(json!({"results": []}))
        }

        async fn reference_list(&self, list: ReferenceList) -> Result<Value> {
            match list {
                ReferenceList::Countries => Ok(json!({"results": [{"code": "NL"}]})),
                ReferenceList::Groups => Err(CacheError::upstream("500")),
                ReferenceList::RegionSpeciesLists => Ok(json!({"detail": "unexpected"})),
                other => Ok(json!([other.cache_key()])),
            }
        }
    }

    fn warmer(store: &MemoryStore) -> (CacheWarmer, Arc<CacheManager>) {
        let cache = Arc::new(CacheManager::new(
            Arc::new(store.clone()),
            KeyNamespace::default(),
            300,
            Arc::new(CacheMetrics::new()),
        ));
        (CacheWarmer::new(Arc::clone(&cache), Arc::new(ReferenceSource)), cache)
    }

    #[tokio::test]
    async fn test_warm_cache_stores_normalized_lists() {
        let store = MemoryStore::new();
        let (warmer, cache) = warmer(&store);
        let api = CacheOptions::new().prefix(API_PREFIX);

        let report = warmer.warm_cache().await;

        assert_eq!(report.failed, vec!["groups:all".to_string()]);
        assert_eq!(report.warmed.len(), 4);
        assert!(!report.warmed.contains(&"challenges:all".to_string()));

        let countries: Option<Value> = cache.get("countries:all", &api).await;
        assert_eq!(countries, Some(json!([{"code": "NL"}])));
        let lists: Option<Value> = cache.get("species-groups:lists", &api).await;
        assert_eq!(lists, Some(json!([])));

        let ttl = store.ttl("obs-explorer:api:countries:all").await.unwrap();
        assert!(ttl > Duration::from_secs(86_000));
    }

    #[tokio::test]
    async fn test_challenges_need_authentication() {
        let store = MemoryStore::new();
        let (warmer, _) = warmer(&store);
        let warmer = warmer.authenticated(true);

        assert_eq!(warmer.lists().len(), 6);
        let report = warmer.warm_cache().await;
        assert!(report.warmed.contains(&"challenges:all".to_string()));

        let ttl = store.ttl("obs-explorer:api:challenges:all").await.unwrap();
        assert!(ttl <= Duration::from_secs(3_600));
    }

    #[tokio::test]
    async fn test_warm_popular_species_defaults() {
        let store = MemoryStore::new();
        let (warmer, _) = warmer(&store);

        let report = warmer.warm_popular_species(&[]).await;
        assert_eq!(report.warmed.len(), 9);
        assert_eq!(report.failed, vec!["species:3".to_string()]);
        assert!(store.exists("obs-explorer:api:species:50").await.unwrap());

        let report = warmer.warm_popular_species(&[7]).await;
        assert_eq!(report.warmed, vec!["species:7".to_string()]);
    }

    #[tokio::test]
    async fn test_store_outage_is_reported_not_raised() {
        let store = MemoryStore::new();
        store.set_available(false);
        let (warmer, _) = warmer(&store);

        let report = warmer.warm_popular_species(&[1, 2]).await;
        assert!(report.warmed.is_empty());
        assert_eq!(report.failed.len(), 2);
    }
}
