//! Key layout shared by every cache service

use serde::{Deserialize, Serialize};

/// Builds store keys under a common root
///
/// | Purpose         | Layout                          |
/// |-----------------|---------------------------------|
/// | plain cache     | `<root>:<prefix?>:<key>`        |
/// | SWR entries     | `<root>:swr:<prefix?>:<key>`    |
/// | tag index sets  | `<root>:tags:<tag>`             |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyNamespace {
    root: String,
}

impl KeyNamespace {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Key for a plain cache entry
    pub fn cache_key(&self, key: &str, prefix: Option<&str>) -> String {
        match non_empty(prefix) {
            Some(prefix) => format!("{}:{}:{}", self.root, prefix, key),
            None => format!("{}:{}", self.root, key),
        }
    }

    /// Key for a stale-while-revalidate entry
    pub fn swr_key(&self, key: &str, prefix: Option<&str>) -> String {
        match non_empty(prefix) {
            Some(prefix) => format!("{}:swr:{}:{}", self.root, prefix, key),
            None => format!("{}:swr:{}", self.root, key),
        }
    }

    /// Key of the set indexing every entry carrying `tag`
    pub fn tag_key(&self, tag: &str) -> String {
        format!("{}:tags:{}", self.root, tag)
    }

    /// Glob covering plain cache entries under `prefix`, or everything under the root
    pub fn cache_pattern(&self, prefix: Option<&str>) -> String {
        self.cache_key("*", prefix)
    }

    /// Glob covering SWR entries under `prefix`, or every SWR entry
    pub fn swr_pattern(&self, prefix: Option<&str>) -> String {
        self.swr_key("*", prefix)
    }

    /// Strip the SWR root from a store key, leaving `<prefix?>:<key>`
    pub fn logical_swr_key<'a>(&self, store_key: &'a str) -> Option<&'a str> {
        store_key
            .strip_prefix(self.root.as_str())
            .and_then(|rest| rest.strip_prefix(":swr:"))
    }
}

impl Default for KeyNamespace {
    fn default() -> Self {
        Self::new("obs-explorer")
    }
}

fn non_empty(prefix: Option<&str>) -> Option<&str> {
    prefix.filter(|p| !p.is_empty())
}
