//! Upstream observation API as seen by the prefetcher and the cache warmer

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Static reference lists that change rarely and are worth warming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReferenceList {
    Countries,
    Regions,
    Groups,
    /// Only available to authenticated clients
    Challenges,
    SpeciesGroups,
    RegionSpeciesLists,
}

impl ReferenceList {
    /// Every list in warming order
    pub const ALL: [ReferenceList; 6] = [
        ReferenceList::Countries,
        ReferenceList::Regions,
        ReferenceList::Groups,
        ReferenceList::Challenges,
        ReferenceList::SpeciesGroups,
        ReferenceList::RegionSpeciesLists,
    ];

    /// Cache key under the `api` prefix
    pub fn cache_key(self) -> &'static str {
        match self {
            ReferenceList::Countries => "countries:all",
            ReferenceList::Regions => "regions:all",
            ReferenceList::Groups => "groups:all",
            ReferenceList::Challenges => "challenges:all",
            ReferenceList::SpeciesGroups => "species-groups:groups",
            ReferenceList::RegionSpeciesLists => "species-groups:lists",
        }
    }

    /// Cache TTL in seconds
    pub fn ttl_secs(self) -> u64 {
        match self {
            ReferenceList::Countries | ReferenceList::Regions | ReferenceList::Groups => 86_400,
            ReferenceList::Challenges => 3_600,
            ReferenceList::SpeciesGroups | ReferenceList::RegionSpeciesLists => 43_200,
        }
    }

    pub fn requires_auth(self) -> bool {
        matches!(self, ReferenceList::Challenges)
    }

    /// Reduce an upstream response to the value worth caching
    ///
    /// Paginated lists are unwrapped to their `results`; regional species
    /// lists must be arrays and anything else becomes empty.
    pub fn normalize(self, response: Value) -> Value {
        match self {
            ReferenceList::Countries | ReferenceList::Challenges | ReferenceList::SpeciesGroups => {
                match response {
                    Value::Object(mut page) if page.contains_key("results") => {
                        page.remove("results").unwrap_or(Value::Null)
                    }
                    other => other,
                }
            }
            ReferenceList::RegionSpeciesLists => match response {
                Value::Array(_) => response,
                _ => Value::Array(Vec::new()),
            },
            ReferenceList::Regions | ReferenceList::Groups => response,
        }
    }
}

/// Read access to the upstream observation API
///
/// Responses are passed through as JSON; the cache never interprets them
/// beyond picking out ids for follow-up prefetches.
#[async_trait]
pub trait ObservationSource: Send + Sync {
    async fn observation(&self, id: i64) -> Result<Value>;

    async fn species(&self, id: i64) -> Result<Value>;

    /// Most recent observations of a user, paginated as `{ "results": [...] }`
    async fn user_observations(&self, user_id: i64, limit: usize) -> Result<Value>;

    async fn species_observations(&self, species_id: i64, limit: usize) -> Result<Value>;

    async fn reference_list(&self, list: ReferenceList) -> Result<Value>;
}

/// Parse an id given as a JSON number or numeric string
pub fn parse_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
