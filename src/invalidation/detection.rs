//! Polling for upstream changes

use super::rules::truthy;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Result of polling one endpoint
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangeSignal {
    pub has_new_data: bool,
    /// Response body, handed to the triggered rule as its data
    pub payload: Value,
}

impl ChangeSignal {
    pub fn new_data(payload: Value) -> Self {
        Self {
            has_new_data: true,
            payload,
        }
    }
}

/// Something that can report whether an endpoint has new data
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn poll(&self, endpoint: &str) -> Result<ChangeSignal>;
}

/// Polls endpoints relative to a base URL over HTTP
///
/// A non-success status is treated as "no new data". A success response must
/// be JSON; its `hasNewData` field decides the signal.
pub struct HttpChangeSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChangeSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl ChangeSource for HttpChangeSource {
    async fn poll(&self, endpoint: &str) -> Result<ChangeSignal> {
        let response = self.client.get(self.url(endpoint)).send().await?;

        if !response.status().is_success() {
            debug!("Change check for {} returned {}", endpoint, response.status());
            return Ok(ChangeSignal::default());
        }

        let payload: Value = response.json().await?;
        Ok(ChangeSignal {
            has_new_data: truthy(payload.get("hasNewData")),
            payload,
        })
    }
}

/// Options for [`super::InvalidationManager::start_change_detection`]
#[derive(Debug, Clone)]
pub struct ChangeDetectionOptions {
    pub check_interval: Duration,
    pub enabled: bool,
    pub endpoints: Vec<String>,
}

impl Default for ChangeDetectionOptions {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(300_000),
            enabled: true,
            endpoints: vec!["/api/observations/check-new".to_string()],
        }
    }
}

/// Rule triggered when `endpoint` reports new data
pub fn rule_for_endpoint(endpoint: &str) -> Option<&'static str> {
    if endpoint.contains("observations") {
        Some("new-observations")
    } else if endpoint.contains("species") {
        Some("species-updates")
    } else if endpoint.contains("user") {
        Some("user-activity")
    } else if endpoint.contains("location") {
        Some("location-changes")
    } else {
        None
    }
}

/// Last successful check per endpoint, bounded by evicting the oldest
#[derive(Debug)]
pub(crate) struct LastChecked {
    entries: HashMap<String, i64>,
    capacity: usize,
}

impl LastChecked {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn record(&mut self, endpoint: &str, at_ms: i64) {
        self.entries.insert(endpoint.to_string(), at_ms);

        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(endpoint, _)| endpoint.clone());
            match oldest {
                Some(endpoint) => self.entries.remove(&endpoint),
                None => break,
            };
        }
    }

    pub(crate) fn get(&self, endpoint: &str) -> Option<i64> {
        self.entries.get(endpoint).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_for_endpoint() {
        assert_eq!(
            rule_for_endpoint("/api/observations/check-new"),
            Some("new-observations")
        );
        assert_eq!(rule_for_endpoint("/api/species/changes"), Some("species-updates"));
        assert_eq!(rule_for_endpoint("/api/user/activity"), Some("user-activity"));
        assert_eq!(rule_for_endpoint("/api/locations/updates"), Some("location-changes"));
        assert_eq!(rule_for_endpoint("/api/health"), None);
    }

    #[test]
    fn test_last_checked_evicts_oldest() {
        let mut last = LastChecked::new(2);
        last.record("a", 1);
        last.record("b", 2);
        last.record("a", 3);
        last.record("c", 4);

        assert_eq!(last.len(), 2);
        assert_eq!(last.get("b"), None);
        assert_eq!(last.get("a"), Some(3));
        assert_eq!(last.get("c"), Some(4));
    }

    #[test]
    fn test_http_source_url() {
        let source = HttpChangeSource::new("http://localhost:3000/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            source.url("/api/observations/check-new"),
            "http://localhost:3000/api/observations/check-new"
        );
    }

    #[tokio::test]
    async fn test_http_source_unreachable_is_an_error() {
        let source = HttpChangeSource::new("http://127.0.0.1:1", Duration::from_millis(500)).unwrap();
        assert!(source.poll("/api/observations/check-new").await.is_err());
    }
}
