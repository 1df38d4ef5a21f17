//! Stale-while-revalidate cache entries
//!
//! An entry records when it was written and two windows measured from that
//! moment. Within `ttl` it is fresh, within `ttl + stale_while_revalidate` it
//! is stale but servable, and beyond that it is expired.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Freshness of an entry at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}

/// Classify an entry of age `age_ms` against its windows (in seconds)
///
/// Both boundaries are inclusive: an entry exactly `ttl` old is still fresh
/// and one exactly `ttl + swr` old is still stale. Negative ages (clock skew
/// between writers) count as fresh.
pub fn classify(age_ms: i64, ttl_secs: u64, swr_secs: u64) -> Freshness {
    let window_ms = |secs: u64| i64::try_from(secs).unwrap_or(i64::MAX).saturating_mul(1000);
    let fresh_until = window_ms(ttl_secs);
    let stale_until = fresh_until.saturating_add(window_ms(swr_secs));

    if age_ms <= fresh_until {
        Freshness::Fresh
    } else if age_ms <= stale_until {
        Freshness::Stale
    } else {
        Freshness::Expired
    }
}

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// A cached value with its SWR metadata, stored as JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    /// The cached value
    pub data: T,

    /// Write time in epoch milliseconds
    pub timestamp: i64,

    /// Freshness window in seconds
    pub ttl: u64,

    /// Stale window in seconds, following `ttl`
    pub stale_while_revalidate: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl<T> CacheEntry<T> {
    /// Create an entry stamped with the current time
    pub fn new(data: T, ttl: u64, stale_while_revalidate: u64) -> Self {
        Self {
            data,
            timestamp: now_millis(),
            ttl,
            stale_while_revalidate,
            tags: Vec::new(),
            version: None,
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        for tag in tags {
            if !self.tags.contains(&tag) {
                self.tags.push(tag);
            }
        }
        self
    }

    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version;
        self
    }

    /// Age in milliseconds relative to `now_ms`
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.timestamp
    }

    /// Freshness relative to `now_ms`
    pub fn freshness_at(&self, now_ms: i64) -> Freshness {
        classify(self.age_ms(now_ms), self.ttl, self.stale_while_revalidate)
    }

    /// Freshness right now
    pub fn freshness(&self) -> Freshness {
        self.freshness_at(now_millis())
    }

    /// Lifetime the store should keep this entry for, in seconds
    pub fn total_ttl(&self) -> u64 {
        self.ttl.saturating_add(self.stale_while_revalidate)
    }
}

/// Entry metadata without decoding the payload, used by maintenance scans
pub type EntryHeader = CacheEntry<serde::de::IgnoredAny>;
