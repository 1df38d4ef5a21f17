//! In-process store with per-key expiry

use super::{expiry_secs, key_pattern, KeyValueStore};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
enum StoredValue {
    Bytes(Vec<u8>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: StoredValue,
    expires_at: Option<Instant>,
}

/// Expiry instant for `ttl` from `now`; a lifetime past what `Instant` can
/// represent never expires
fn deadline(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(Duration::from_secs(expiry_secs(ttl)))
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

/// Thread-safe in-memory [`KeyValueStore`]
///
/// Mirrors the Redis semantics the cache relies on: lazy expiry, sets created
/// on first add, and `WRONGTYPE` errors when a key is used as the wrong kind.
/// [`MemoryStore::set_available`] simulates an outage.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    slots: Arc<RwLock<HashMap<String, Slot>>>,
    available: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Toggle availability; while unavailable every command fails
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let slots = self.slots.read().await;
        slots.values().filter(|slot| !slot.is_expired(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remaining lifetime of a key, if it exists and has an expiry
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let slots = self.slots.read().await;
        slots
            .get(key)
            .filter(|slot| !slot.is_expired(now))
            .and_then(|slot| slot.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::StoreUnavailable("memory store is offline".to_string()))
        }
    }

    fn wrong_type(key: &str) -> CacheError {
        CacheError::Other(format!(
            "WRONGTYPE operation against a key holding the wrong kind of value: {}",
            key
        ))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        let now = Instant::now();
        let slots = self.slots.read().await;

        match slots.get(key) {
            Some(slot) if slot.is_expired(now) => Ok(None),
            Some(Slot { value: StoredValue::Bytes(bytes), .. }) => Ok(Some(bytes.clone())),
            Some(Slot { value: StoredValue::Set(_), .. }) => Err(Self::wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set_with_expiry(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.check_available()?;
        let expires_at = deadline(Instant::now(), ttl);
        let mut slots = self.slots.write().await;
        slots.insert(
            key.to_string(),
            Slot {
                value: StoredValue::Bytes(value.to_vec()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut slots = self.slots.write().await;
        Ok(matches!(slots.remove(key), Some(slot) if !slot.is_expired(now)))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        let slots = self.slots.read().await;
        Ok(slots.get(key).map_or(false, |slot| !slot.is_expired(now)))
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        self.check_available()?;
        let matcher = key_pattern(pattern)?;
        let now = Instant::now();
        let mut slots = self.slots.write().await;

        let before = slots.len();
        slots.retain(|_, slot| !slot.is_expired(now));
        let purged = before - slots.len();
        if purged > 0 {
            debug!("Purged {} expired keys from memory store", purged);
        }

        let mut keys: Vec<String> = slots
            .keys()
            .filter(|key| matcher.matches(key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn add_to_set(&self, set_key: &str, member: &str) -> Result<()> {
        self.check_available()?;
        let now = Instant::now();
        let mut slots = self.slots.write().await;

        if slots.get(set_key).map_or(false, |slot| slot.is_expired(now)) {
            slots.remove(set_key);
        }

        let slot = slots.entry(set_key.to_string()).or_insert_with(|| Slot {
            value: StoredValue::Set(BTreeSet::new()),
            expires_at: None,
        });

        match &mut slot.value {
            StoredValue::Set(members) => {
                members.insert(member.to_string());
                Ok(())
            }
            StoredValue::Bytes(_) => Err(Self::wrong_type(set_key)),
        }
    }

    async fn members_of(&self, set_key: &str) -> Result<Vec<String>> {
        self.check_available()?;
        let now = Instant::now();
        let slots = self.slots.read().await;

        match slots.get(set_key) {
            Some(slot) if slot.is_expired(now) => Ok(Vec::new()),
            Some(Slot { value: StoredValue::Set(members), .. }) => {
                Ok(members.iter().cloned().collect())
            }
            Some(Slot { value: StoredValue::Bytes(_), .. }) => Err(Self::wrong_type(set_key)),
            None => Ok(Vec::new()),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check_available()?;
        let now = Instant::now();
        let mut slots = self.slots.write().await;

        match slots.get_mut(key) {
            Some(slot) if !slot.is_expired(now) => {
                slot.expires_at = deadline(now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
