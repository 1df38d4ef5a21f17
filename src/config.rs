//! Configuration for the caching layer

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Runtime configuration shared by every cache service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Redis connection URL. When absent the layer runs against a null store
    /// and every read degrades to a direct fetch.
    pub redis_url: Option<String>,

    /// Root namespace prepended to every key
    pub namespace: String,

    /// Freshness window for new entries
    pub default_ttl: Duration,

    /// Grace period after `default_ttl` during which stale data is served
    pub default_stale_while_revalidate: Duration,

    /// Lifetime of tag index sets
    pub tag_ttl: Duration,

    /// Timeout for establishing the store connection
    pub connect_timeout: Duration,

    /// Timeout for a single store command
    pub command_timeout: Duration,

    /// How long deduplicated callers wait before giving up
    pub dedupe_timeout: Duration,

    /// Maximum number of prefetches running at once
    pub prefetch_max_concurrent: usize,

    /// Delay before the prefetch queue is drained again
    pub prefetch_reschedule_delay: Duration,

    /// Upper bound for a background revalidation or prefetch fetch
    pub background_task_timeout: Duration,

    /// Polling interval for change detection
    pub change_detection_interval: Duration,

    /// Base URL the change detection endpoints are resolved against
    pub change_detection_base_url: String,

    /// Capacity of the per-endpoint last-checked map
    pub max_last_checked: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            namespace: "obs-explorer".to_string(),
            // 5 minutes fresh, 1 hour stale
            default_ttl: Duration::from_secs(300),
            default_stale_while_revalidate: Duration::from_secs(3600),
            // Tag sets live for a day
            tag_ttl: Duration::from_secs(86_400),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
            dedupe_timeout: Duration::from_millis(30_000),
            prefetch_max_concurrent: 3,
            prefetch_reschedule_delay: Duration::from_millis(100),
            background_task_timeout: Duration::from_secs(30),
            // Check for new data every 5 minutes
            change_detection_interval: Duration::from_millis(300_000),
            change_detection_base_url: "http://localhost:3000".to_string(),
            max_last_checked: 1000,
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Load configuration from the environment, reading `.env` first if present
    ///
    /// Unset variables fall back to defaults. Variables that are set but
    /// malformed are reported as configuration errors.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            redis_url: std::env::var("REDIS_URL").ok().filter(|url| !url.trim().is_empty()),
            namespace: std::env::var("CACHE_NAMESPACE").unwrap_or(defaults.namespace),
            default_ttl: env_duration("CACHE_DEFAULT_TTL_SECS", Duration::from_secs)?
                .unwrap_or(defaults.default_ttl),
            default_stale_while_revalidate: env_duration(
                "CACHE_DEFAULT_SWR_SECS",
                Duration::from_secs,
            )?
            .unwrap_or(defaults.default_stale_while_revalidate),
            dedupe_timeout: env_duration("DEDUPE_TIMEOUT_MS", Duration::from_millis)?
                .unwrap_or(defaults.dedupe_timeout),
            change_detection_interval: env_duration(
                "CHANGE_DETECTION_INTERVAL_MS",
                Duration::from_millis,
            )?
            .unwrap_or(defaults.change_detection_interval),
            change_detection_base_url: std::env::var("CHANGE_DETECTION_BASE_URL")
                .unwrap_or(defaults.change_detection_base_url),
            ..defaults
        };

        if config.redis_url.is_none() {
            warn!("REDIS_URL is not set, caching is disabled and reads go straight upstream");
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(CacheError::Config("namespace must not be empty".to_string()));
        }

        if self.namespace.contains('*') {
            return Err(CacheError::Config(
                "namespace must not contain wildcards".to_string(),
            ));
        }

        if self.default_ttl.is_zero() {
            return Err(CacheError::Config("default_ttl must be greater than 0".to_string()));
        }

        if self.prefetch_max_concurrent == 0 {
            return Err(CacheError::Config(
                "prefetch_max_concurrent must be greater than 0".to_string(),
            ));
        }

        if self.dedupe_timeout.is_zero() || self.background_task_timeout.is_zero() {
            return Err(CacheError::Config("timeouts must be greater than 0".to_string()));
        }

        if self.change_detection_interval.is_zero() {
            return Err(CacheError::Config(
                "change_detection_interval must be greater than 0".to_string(),
            ));
        }

        if self.max_last_checked == 0 {
            return Err(CacheError::Config(
                "max_last_checked must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Default TTL in whole seconds, as stored in entries
    pub fn default_ttl_secs(&self) -> u64 {
        self.default_ttl.as_secs()
    }

    /// Default stale-while-revalidate window in whole seconds
    pub fn default_swr_secs(&self) -> u64 {
        self.default_stale_while_revalidate.as_secs()
    }
}

fn env_duration(name: &str, unit: fn(u64) -> Duration) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|value| Some(unit(value)))
            .map_err(|e| CacheError::Config(format!("{} must be an integer: {}", name, e))),
        Err(_) => Ok(None),
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    redis_url: Option<String>,
    namespace: Option<String>,
    default_ttl: Option<Duration>,
    default_stale_while_revalidate: Option<Duration>,
    tag_ttl: Option<Duration>,
    connect_timeout: Option<Duration>,
    command_timeout: Option<Duration>,
    dedupe_timeout: Option<Duration>,
    prefetch_max_concurrent: Option<usize>,
    prefetch_reschedule_delay: Option<Duration>,
    background_task_timeout: Option<Duration>,
    change_detection_interval: Option<Duration>,
    change_detection_base_url: Option<String>,
    max_last_checked: Option<usize>,
}

impl CacheConfigBuilder {
    /// Set the Redis connection URL
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Set the root key namespace
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set default TTL for cache entries
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Set default stale-while-revalidate window
    pub fn default_stale_while_revalidate(mut self, window: Duration) -> Self {
        self.default_stale_while_revalidate = Some(window);
        self
    }

    /// Set lifetime of tag index sets
    pub fn tag_ttl(mut self, ttl: Duration) -> Self {
        self.tag_ttl = Some(ttl);
        self
    }

    /// Set store connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set store command timeout
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Set deduplication timeout
    pub fn dedupe_timeout(mut self, timeout: Duration) -> Self {
        self.dedupe_timeout = Some(timeout);
        self
    }

    /// Set maximum concurrent prefetches
    pub fn prefetch_max_concurrent(mut self, max: usize) -> Self {
        self.prefetch_max_concurrent = Some(max);
        self
    }

    /// Set prefetch queue reschedule delay
    pub fn prefetch_reschedule_delay(mut self, delay: Duration) -> Self {
        self.prefetch_reschedule_delay = Some(delay);
        self
    }

    /// Set timeout for background fetches
    pub fn background_task_timeout(mut self, timeout: Duration) -> Self {
        self.background_task_timeout = Some(timeout);
        self
    }

    /// Set change detection polling interval
    pub fn change_detection_interval(mut self, interval: Duration) -> Self {
        self.change_detection_interval = Some(interval);
        self
    }

    /// Set change detection base URL
    pub fn change_detection_base_url(mut self, url: impl Into<String>) -> Self {
        self.change_detection_base_url = Some(url.into());
        self
    }

    /// Set capacity of the last-checked map
    pub fn max_last_checked(mut self, max: usize) -> Self {
        self.max_last_checked = Some(max);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            redis_url: self.redis_url.or(defaults.redis_url),
            namespace: self.namespace.unwrap_or(defaults.namespace),
            default_ttl: self.default_ttl.unwrap_or(defaults.default_ttl),
            default_stale_while_revalidate: self
                .default_stale_while_revalidate
                .unwrap_or(defaults.default_stale_while_revalidate),
            tag_ttl: self.tag_ttl.unwrap_or(defaults.tag_ttl),
            connect_timeout: self.connect_timeout.unwrap_or(defaults.connect_timeout),
            command_timeout: self.command_timeout.unwrap_or(defaults.command_timeout),
            dedupe_timeout: self.dedupe_timeout.unwrap_or(defaults.dedupe_timeout),
            prefetch_max_concurrent: self
                .prefetch_max_concurrent
                .unwrap_or(defaults.prefetch_max_concurrent),
            prefetch_reschedule_delay: self
                .prefetch_reschedule_delay
                .unwrap_or(defaults.prefetch_reschedule_delay),
            background_task_timeout: self
                .background_task_timeout
                .unwrap_or(defaults.background_task_timeout),
            change_detection_interval: self
                .change_detection_interval
                .unwrap_or(defaults.change_detection_interval),
            change_detection_base_url: self
                .change_detection_base_url
                .unwrap_or(defaults.change_detection_base_url),
            max_last_checked: self.max_last_checked.unwrap_or(defaults.max_last_checked),
        }
    }
}

/// Preset configurations
impl CacheConfig {
    /// Short timings for tests and local experiments
    pub fn testing() -> Self {
        Self {
            namespace: "obs-test".to_string(),
            default_ttl: Duration::from_secs(1),
            default_stale_while_revalidate: Duration::from_secs(2),
            connect_timeout: Duration::from_millis(500),
            command_timeout: Duration::from_millis(500),
            dedupe_timeout: Duration::from_secs(2),
            prefetch_reschedule_delay: Duration::from_millis(20),
            background_task_timeout: Duration::from_secs(2),
            change_detection_interval: Duration::from_millis(100),
            ..Default::default()
        }
    }
}
