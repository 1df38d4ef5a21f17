//! Rule-based cache invalidation
//!
//! The [`InvalidationManager`] owns a registry of named rules over the SWR
//! cache and offers several entry points:
//!
//! - [`InvalidationManager::invalidate_by_rule`] applies a rule and its cascades
//! - [`InvalidationManager::smart_invalidate`] maps a described change to rules
//! - [`InvalidationManager::manual_invalidate`] is the audited operator path
//! - change detection polls endpoints and triggers rules when they report new data
//!
//! Every entry point returns a count of removed entries and never fails; errors
//! are logged, metered, and reported as 0.

mod detection;
mod rules;

pub use detection::{
    rule_for_endpoint, ChangeDetectionOptions, ChangeSignal, ChangeSource, HttpChangeSource,
};
pub use rules::{
    default_rules, pattern_prefix, truthy, AffectedData, DataKind, InvalidationRule,
    RuleCondition, RuleSummary,
};

use crate::entry::now_millis;
use crate::error::{CacheError, Result};
use crate::metrics::CacheMetrics;
use crate::swr::SwrCache;
use detection::LastChecked;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What a manual invalidation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationScope {
    Tag,
    Pattern,
    #[default]
    Rule,
}

/// Summary returned by [`InvalidationManager::get_stats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationStats {
    pub rules_count: usize,
    pub change_detection_active: bool,
    pub rules: Vec<String>,
}

/// Registry of invalidation rules plus the change detection loop
pub struct InvalidationManager {
    swr: Arc<SwrCache>,
    rules: RwLock<BTreeMap<String, InvalidationRule>>,
    change_source: Arc<dyn ChangeSource>,
    detection: Mutex<Option<JoinHandle<()>>>,
    last_checked: Mutex<LastChecked>,
    metrics: Arc<CacheMetrics>,
}

impl InvalidationManager {
    /// Create a manager with the default rule set installed
    pub fn new(
        swr: Arc<SwrCache>,
        change_source: Arc<dyn ChangeSource>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        let rules = default_rules()
            .into_iter()
            .map(|rule| (rule.name.clone(), rule))
            .collect();

        Self {
            swr,
            rules: RwLock::new(rules),
            change_source,
            detection: Mutex::new(None),
            last_checked: Mutex::new(LastChecked::new(1000)),
            metrics,
        }
    }

    /// Bound the number of endpoints remembered by change detection
    pub fn with_last_checked_capacity(self, capacity: usize) -> Self {
        *self.last_checked.lock() = LastChecked::new(capacity);
        self
    }

    /// Register a rule, replacing any rule with the same name
    pub fn add_rule(&self, rule: InvalidationRule) {
        debug!("Registering invalidation rule: {}", rule.name);
        self.rules.write().insert(rule.name.clone(), rule);
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        self.rules.write().remove(name).is_some()
    }

    pub fn rule(&self, name: &str) -> Option<InvalidationRule> {
        self.rules.read().get(name).cloned()
    }

    /// Summaries of every registered rule, ordered by name
    pub fn rules(&self) -> Vec<RuleSummary> {
        self.rules.read().values().map(InvalidationRule::summary).collect()
    }

    /// Apply the rule `name` and its cascades
    ///
    /// Unknown rules and rules whose condition rejects `data` contribute 0.
    /// Each rule is applied at most once per call, so cascade cycles terminate.
    pub async fn invalidate_by_rule(&self, name: &str, data: Option<&Value>) -> usize {
        let started = Instant::now();
        let mut visited = HashSet::new();
        let removed = self.apply_rule(name, data, &mut visited).await;
        self.metrics.record_invalidation("rule", removed);
        debug!(
            "Rule {} invalidated {} entries in {:?}",
            name,
            removed,
            started.elapsed()
        );
        removed
    }

    fn apply_rule<'a>(
        &'a self,
        name: &'a str,
        data: Option<&'a Value>,
        visited: &'a mut HashSet<String>,
    ) -> BoxFuture<'a, usize> {
        async move {
            if !visited.insert(name.to_string()) {
                debug!("Rule {} already applied in this pass", name);
                return 0;
            }

            let Some(rule) = self.rule(name) else {
                warn!("Invalidation rule not found: {}", name);
                return 0;
            };

            if !rule.applies_to(data) {
                debug!("Rule {} condition not met, skipping", name);
                return 0;
            }

            match self.run_rule(&rule, data, visited).await {
                Ok(removed) => {
                    info!("Rule {} invalidated {} cache entries", name, removed);
                    removed
                }
                Err(e) => {
                    error!("Error applying invalidation rule {}: {}", name, e);
                    self.metrics.record_error("invalidation_rule", &e);
                    0
                }
            }
        }
        .boxed()
    }

    async fn run_rule(
        &self,
        rule: &InvalidationRule,
        data: Option<&Value>,
        visited: &mut HashSet<String>,
    ) -> Result<usize> {
        let mut removed = 0;

        for tag in &rule.tags {
            removed += self.swr.try_invalidate_by_tag(tag).await?;
        }

        if let Some(prefix) = rule.clear_prefix() {
            removed += self.swr.try_clear(Some(&prefix)).await?;
        }

        for cascaded in &rule.cascade {
            removed += self.apply_rule(cascaded, data, visited).await;
        }

        Ok(removed)
    }

    /// Pick rules for a described change and apply them
    ///
    /// `change_type` is a free-form label (for example `observation_update`)
    /// used for logging only; the rules are chosen from `affected.kind`.
    pub async fn smart_invalidate(&self, change_type: &str, affected: &AffectedData) -> usize {
        info!("Smart invalidation triggered: {} ({:?})", change_type, affected.kind);

        let data = match serde_json::to_value(affected) {
            Ok(data) => data,
            Err(e) => {
                let e = CacheError::from(e);
                error!("Smart invalidation failed for {}: {}", change_type, e);
                self.metrics.record_error("smart_invalidation", &e);
                return 0;
            }
        };

        let rules: Vec<&str> = match affected.kind {
            DataKind::Observation => {
                let mut rules = vec!["new-observations"];
                if affected.flag("location") {
                    rules.push("location-changes");
                }
                if affected.flag("userId") {
                    rules.push("user-activity");
                }
                rules
            }
            DataKind::Species => {
                let mut rules = vec!["species-updates"];
                if affected.flag("hasPhotos") || affected.flag("hasDescription") {
                    rules.push("new-observations");
                }
                rules
            }
            DataKind::User => vec!["user-activity"],
            DataKind::Location => vec!["location-changes"],
            DataKind::Unknown => {
                warn!("Unknown data type for smart invalidation: {}", change_type);
                return 0;
            }
        };

        let mut total = 0;
        for rule in rules {
            total += self.invalidate_by_rule(rule, Some(&data)).await;
        }

        info!("Smart invalidation completed: {} entries invalidated", total);
        total
    }

    /// Operator-initiated invalidation; the reason is always logged
    pub async fn manual_invalidate(&self, target: &str, reason: &str, scope: InvalidationScope) -> usize {
        info!("Manual invalidation: {} (reason: {}, scope: {:?})", target, reason, scope);

        let removed = match scope {
            InvalidationScope::Tag => self.swr.invalidate_by_tag(target).await,
            InvalidationScope::Pattern => match pattern_prefix(target) {
                Some(prefix) => self.swr.clear(Some(&prefix)).await,
                None => {
                    warn!("Refusing manual invalidation of empty pattern: {}", target);
                    0
                }
            },
            InvalidationScope::Rule => self.invalidate_by_rule(target, None).await,
        };

        self.metrics.record_invalidation("manual", removed);
        info!("Manual invalidation completed: {} entries invalidated", removed);
        removed
    }

    /// Report entries past their stale window that the store still holds
    ///
    /// Entries are removed by store expiry; this only counts them.
    pub async fn invalidate_stale_data(&self, max_age_secs: u64) -> usize {
        info!("Checking for stale data (max age: {}s)", max_age_secs);
        let stats = self.swr.get_stats(None).await;
        debug!("Cache stats before cleanup: {:?}", stats);
        info!("Found {} expired entries awaiting store expiry", stats.expired_entries);
        stats.expired_entries
    }

    /// Start polling `options.endpoints` every `options.check_interval`
    ///
    /// Returns `false` if detection is disabled or already running. The loop
    /// holds a weak reference and ends on its own when the manager is dropped.
    pub fn start_change_detection(self: &Arc<Self>, options: ChangeDetectionOptions) -> bool {
        if !options.enabled {
            debug!("Change detection disabled");
            return false;
        }

        let mut detection = self.detection.lock();
        if detection.as_ref().map_or(false, |handle| !handle.is_finished()) {
            debug!("Change detection already running");
            return false;
        }

        info!(
            "Starting change detection every {:?} for {} endpoints",
            options.check_interval,
            options.endpoints.len()
        );

        let manager: Weak<Self> = Arc::downgrade(self);
        let period = options.check_interval;
        let endpoints = options.endpoints;

        *detection = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    debug!("Invalidation manager dropped, stopping change detection");
                    break;
                };
                manager.check_for_changes(&endpoints).await;
            }
        }));

        true
    }

    /// Stop the polling loop if it is running
    pub fn stop_change_detection(&self) -> bool {
        match self.detection.lock().take() {
            Some(handle) => {
                handle.abort();
                info!("Stopped change detection");
                true
            }
            None => false,
        }
    }

    pub fn change_detection_active(&self) -> bool {
        self.detection
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Poll each endpoint once and apply the mapped rule when new data is reported
    ///
    /// Returns the total number of entries invalidated. Poll failures are
    /// logged and skipped.
    pub async fn check_for_changes(&self, endpoints: &[String]) -> usize {
        let mut total = 0;

        for endpoint in endpoints {
            let signal = match self.change_source.poll(endpoint).await {
                Ok(signal) => signal,
                Err(e) => {
                    warn!("Error checking for changes in {}: {}", endpoint, e);
                    self.metrics.record_error("change_detection", &e);
                    continue;
                }
            };

            if signal.has_new_data {
                info!("New data detected at {}", endpoint);
                self.metrics.record_new_data_detection();
                match rule_for_endpoint(endpoint) {
                    Some(rule) => {
                        total += self.invalidate_by_rule(rule, Some(&signal.payload)).await;
                    }
                    None => debug!("No invalidation rule mapped to {}", endpoint),
                }
            }

            self.last_checked.lock().record(endpoint, now_millis());
        }

        total
    }

    /// Epoch milliseconds of the last successful check of `endpoint`
    pub fn last_checked(&self, endpoint: &str) -> Option<i64> {
        self.last_checked.lock().get(endpoint)
    }

    pub fn get_stats(&self) -> InvalidationStats {
        let rules: Vec<String> = self.rules.read().keys().cloned().collect();
        InvalidationStats {
            rules_count: rules.len(),
            change_detection_active: self.change_detection_active(),
            rules,
        }
    }

    pub async fn invalidate_observation_caches(&self, observation_id: impl Into<Value>) -> usize {
        let affected = AffectedData::new(DataKind::Observation).with_id(observation_id);
        self.smart_invalidate("observation_update", &affected).await
    }

    pub async fn invalidate_species_caches(&self, species_id: impl Into<Value>) -> usize {
        let affected = AffectedData::new(DataKind::Species).with_id(species_id);
        self.smart_invalidate("species_update", &affected).await
    }

    pub async fn invalidate_user_caches(&self, user_id: impl Into<Value>) -> usize {
        let affected = AffectedData::new(DataKind::User).with_id(user_id);
        self.smart_invalidate("user_update", &affected).await
    }

    pub async fn invalidate_location_caches(&self, location_id: impl Into<Value>) -> usize {
        let affected = AffectedData::new(DataKind::Location).with_id(location_id);
        self.smart_invalidate("location_update", &affected).await
    }
}

impl Drop for InvalidationManager {
    fn drop(&mut self) {
        if let Some(handle) = self.detection.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::BackgroundTasks;
    use crate::store::{KeyNamespace, KeyValueStore, MemoryStore};
    use crate::swr::SwrOptions;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Change source returning canned signals and counting polls
    #[derive(Default)]
    struct FakeSource {
        signals: Mutex<HashMap<String, ChangeSignal>>,
        polls: AtomicU32,
    }

    impl FakeSource {
        fn signal(&self, endpoint: &str, signal: ChangeSignal) {
            self.signals.lock().insert(endpoint.to_string(), signal);
        }
    }

    #[async_trait]
    impl ChangeSource for FakeSource {
        async fn poll(&self, endpoint: &str) -> Result<ChangeSignal> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            match self.signals.lock().get(endpoint) {
                Some(signal) => Ok(signal.clone()),
                None => Err(CacheError::Http(format!("no route for {}", endpoint))),
            }
        }
    }

    struct Fixture {
        store: MemoryStore,
        swr: Arc<SwrCache>,
        source: Arc<FakeSource>,
        manager: Arc<InvalidationManager>,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let metrics = Arc::new(CacheMetrics::new());
        let swr = Arc::new(SwrCache::new(
            Arc::new(store.clone()),
            KeyNamespace::default(),
            Arc::clone(&metrics),
            BackgroundTasks::new(),
        ));
        let source = Arc::new(FakeSource::default());
        let manager = Arc::new(InvalidationManager::new(
            Arc::clone(&swr),
            source.clone(),
            metrics,
        ));
        Fixture {
            store,
            swr,
            source,
            manager,
        }
    }

    async fn seed(swr: &SwrCache, key: &str, tags: &[&str]) {
        assert!(swr.set(key, &json!(key), &SwrOptions::new().tags(tags.iter().copied())).await);
    }

    #[tokio::test]
    async fn test_rule_clears_tags_then_pattern() {
        let f = fixture();
        f.manager.add_rule(
            InvalidationRule::new("r1")
                .pattern("obs:*")
                .tags(["t1"]),
        );

        seed(&f.swr, "obs:1", &["t1"]).await;
        seed(&f.swr, "obs:2", &[]).await;
        seed(&f.swr, "species:1", &[]).await;

        assert_eq!(f.manager.invalidate_by_rule("r1", None).await, 2);
        assert!(!f.store.exists("obs-explorer:swr:obs:2").await.unwrap());
        assert!(f.store.exists("obs-explorer:swr:species:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_rule_returns_zero() {
        let f = fixture();
        assert_eq!(f.manager.invalidate_by_rule("missing", None).await, 0);
    }

    #[tokio::test]
    async fn test_condition_false_skips_rule_and_cascades() {
        let f = fixture();
        f.manager.add_rule(
            InvalidationRule::new("guarded")
                .tags(["g"])
                .condition(|d| d["apply"] == json!(true))
                .cascade(["dashboard-data"]),
        );
        seed(&f.swr, "a", &["g"]).await;
        seed(&f.swr, "dashboard:home", &[]).await;

        assert_eq!(
            f.manager.invalidate_by_rule("guarded", Some(&json!({"apply": false}))).await,
            0
        );
        assert!(f.store.exists("obs-explorer:swr:a").await.unwrap());

        assert_eq!(
            f.manager.invalidate_by_rule("guarded", Some(&json!({"apply": true}))).await,
            2
        );
    }

    #[tokio::test]
    async fn test_cascade_cycle_terminates() {
        let f = fixture();
        f.manager.add_rule(InvalidationRule::new("a").tags(["ta"]).cascade(["b"]));
        f.manager.add_rule(InvalidationRule::new("b").tags(["tb"]).cascade(["a", "b"]));
        seed(&f.swr, "x", &["ta"]).await;
        seed(&f.swr, "y", &["tb"]).await;

        let removed = tokio::time::timeout(
            Duration::from_secs(1),
            f.manager.invalidate_by_rule("a", None),
        )
        .await
        .unwrap();
        assert_eq!(removed, 2);
    }

    #[tokio::test]
    async fn test_store_failure_returns_zero() {
        let f = fixture();
        f.store.set_available(false);
        assert_eq!(f.manager.invalidate_by_rule("new-observations", None).await, 0);
        assert!(f
            .manager
            .metrics
            .snapshot()
            .errors
            .contains_key("invalidation_rule:store_unavailable"));
    }

    #[tokio::test]
    async fn test_default_cascade_reaches_dashboard() {
        let f = fixture();
        seed(&f.swr, "observations:recent", &[]).await;
        seed(&f.swr, "dashboard:summary", &[]).await;
        seed(&f.swr, "stats", &["statistics"]).await;
        seed(&f.swr, "species:9", &[]).await;

        // user-stats is not registered, so only dashboard-data cascades
        let removed = f.manager.invalidate_by_rule("new-observations", None).await;
        assert_eq!(removed, 3);
        assert!(f.store.exists("obs-explorer:swr:species:9").await.unwrap());
    }

    #[tokio::test]
    async fn test_smart_invalidate_observation_with_location() {
        let f = fixture();
        seed(&f.swr, "near-me", &["geographic"]).await;
        seed(&f.swr, "observations:1", &[]).await;
        seed(&f.swr, "user:7", &[]).await;

        let affected = AffectedData::new(DataKind::Observation)
            .with_id(1)
            .with_metadata("location", "NZ");
        let removed = f.manager.smart_invalidate("observation_update", &affected).await;

        assert_eq!(removed, 2);
        assert!(f.store.exists("obs-explorer:swr:user:7").await.unwrap());
    }

    #[tokio::test]
    async fn test_smart_invalidate_species_respects_condition() {
        let f = fixture();
        seed(&f.swr, "species:3", &[]).await;

        assert_eq!(f.manager.invalidate_species_caches(3).await, 0);
        assert!(f.store.exists("obs-explorer:swr:species:3").await.unwrap());

        let affected = AffectedData::new(DataKind::Species)
            .with_id(3)
            .with_metadata("hasPhotos", true);
        assert_eq!(f.manager.smart_invalidate("species_update", &affected).await, 1);
    }

    #[tokio::test]
    async fn test_smart_invalidate_unknown_kind() {
        let f = fixture();
        let affected: AffectedData = serde_json::from_value(json!({"type": "comet"})).unwrap();
        assert_eq!(f.manager.smart_invalidate("comet_update", &affected).await, 0);
    }

    #[tokio::test]
    async fn test_user_and_location_wrappers() {
        let f = fixture();
        seed(&f.swr, "user:1", &[]).await;
        seed(&f.swr, "locations:1", &[]).await;

        assert_eq!(f.manager.invalidate_user_caches("1").await, 1);
        assert_eq!(f.manager.invalidate_location_caches(1).await, 1);
        assert_eq!(f.manager.invalidate_observation_caches(1).await, 0);
    }

    #[tokio::test]
    async fn test_manual_invalidate_scopes() {
        let f = fixture();
        seed(&f.swr, "a", &["countries"]).await;
        seed(&f.swr, "obs:1", &[]).await;
        seed(&f.swr, "static:regions", &[]).await;

        assert_eq!(
            f.manager.manual_invalidate("countries", "data fix", InvalidationScope::Tag).await,
            1
        );
        assert_eq!(
            f.manager.manual_invalidate("obs:*", "reimport", InvalidationScope::Pattern).await,
            1
        );
        assert_eq!(
            f.manager.manual_invalidate("static-data", "deploy", InvalidationScope::Rule).await,
            1
        );
        assert_eq!(
            f.manager.manual_invalidate("*", "oops", InvalidationScope::Pattern).await,
            0
        );
    }

    #[tokio::test]
    async fn test_invalidate_stale_data_counts_expired() {
        let f = fixture();
        f.store
            .set_with_expiry("obs-explorer:swr:bad", b"{", Duration::from_secs(60))
            .await
            .unwrap();
        seed(&f.swr, "good", &[]).await;

        assert_eq!(f.manager.invalidate_stale_data(86_400).await, 1);
    }

    #[tokio::test]
    async fn test_check_for_changes_triggers_mapped_rule() {
        let f = fixture();
        seed(&f.swr, "observations:latest", &[]).await;
        f.source.signal(
            "/api/observations/check-new",
            ChangeSignal::new_data(json!({"hasNewData": true})),
        );
        f.source.signal("/api/species/check-new", ChangeSignal::default());

        let endpoints = vec![
            "/api/observations/check-new".to_string(),
            "/api/species/check-new".to_string(),
            "/api/broken".to_string(),
        ];
        assert_eq!(f.manager.check_for_changes(&endpoints).await, 1);

        assert!(f.manager.last_checked("/api/observations/check-new").is_some());
        assert!(f.manager.last_checked("/api/species/check-new").is_some());
        assert!(f.manager.last_checked("/api/broken").is_none());
        assert_eq!(f.manager.metrics.snapshot().new_data_detections, 1);
    }

    #[tokio::test]
    async fn test_change_detection_lifecycle() {
        let f = fixture();
        f.source.signal("/api/observations/check-new", ChangeSignal::default());
        let options = ChangeDetectionOptions {
            check_interval: Duration::from_millis(20),
            ..Default::default()
        };

        assert!(f.manager.start_change_detection(options.clone()));
        assert!(!f.manager.start_change_detection(options.clone()));
        assert!(f.manager.get_stats().change_detection_active);

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert!(f.source.polls.load(Ordering::SeqCst) >= 2);

        assert!(f.manager.stop_change_detection());
        assert!(!f.manager.stop_change_detection());
        tokio::task::yield_now().await;
        assert!(!f.manager.get_stats().change_detection_active);

        let disabled = ChangeDetectionOptions {
            enabled: false,
            ..options
        };
        assert!(!f.manager.start_change_detection(disabled));
    }

    #[tokio::test]
    async fn test_stats_and_rule_registry() {
        let f = fixture();
        let stats = f.manager.get_stats();
        assert_eq!(stats.rules_count, 6);
        assert!(!stats.change_detection_active);
        assert!(stats.rules.contains(&"static-data".to_string()));

        f.manager.add_rule(InvalidationRule::new("custom").tags(["x"]));
        assert_eq!(f.manager.get_stats().rules_count, 7);
        assert!(f.manager.remove_rule("custom"));
        assert!(!f.manager.remove_rule("custom"));
        assert_eq!(f.manager.rules().len(), 6);
    }

    #[test]
    fn test_last_checked_capacity() {
        let store = MemoryStore::new();
        let metrics = Arc::new(CacheMetrics::new());
        let swr = Arc::new(SwrCache::new(
            Arc::new(store),
            KeyNamespace::default(),
            Arc::clone(&metrics),
            BackgroundTasks::new(),
        ));
        let manager = InvalidationManager::new(swr, Arc::new(FakeSource::default()), metrics)
            .with_last_checked_capacity(1);

        let mut last = manager.last_checked.lock();
        last.record("a", 1);
        last.record("b", 2);
        assert_eq!(last.len(), 1);
    }
}
