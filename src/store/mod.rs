//! Key-value store abstraction
//!
//! Every cache service talks to storage through [`KeyValueStore`]. Values are
//! opaque byte strings with an expiry; sets hold string members and back the
//! tag index. Three backends are provided:
//!
//! - [`RedisStore`] for production, connected lazily with a cooldown after failures
//! - [`MemoryStore`] for tests and single-process use
//! - [`NullStore`] when no store is configured; it is never available

mod memory;
mod namespace;
mod null;
mod redis_store;

pub use memory::MemoryStore;
pub use namespace::KeyNamespace;
pub use null::NullStore;
pub use redis_store::RedisStore;

use crate::error::{CacheError, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Minimal contract the cache layer needs from a key-value store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Backend name used in logs and health output
    fn backend(&self) -> &'static str;

    /// Whether the store can currently serve commands
    async fn is_available(&self) -> bool;

    /// Read a value. Absent or expired keys yield `None`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a value that expires after `ttl`
    async fn set_with_expiry(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Delete a single key, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete several keys, returning how many existed
    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Whether a key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// All keys matching a glob pattern (`*` and `?`)
    ///
    /// This is a full keyspace scan on Redis and is intended for maintenance
    /// paths (flush, clear, stats), not for hot reads.
    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>>;

    /// Add a member to the set stored at `set_key`, creating it if needed
    async fn add_to_set(&self, set_key: &str, member: &str) -> Result<()>;

    /// All members of the set stored at `set_key`
    async fn members_of(&self, set_key: &str) -> Result<Vec<String>>;

    /// Set a key's expiry, returning whether the key exists
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Release any held connection
    async fn close(&self) {}
}

/// Outcome of a cache read at the store boundary
///
/// `Degraded` carries the store or decode failure so the public API can log
/// it once and fall back to the upstream fetch.
#[derive(Debug)]
pub enum Lookup<T> {
    Hit(T),
    Miss,
    Degraded(CacheError),
}

impl<T> Lookup<T> {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Lookup::Degraded(_))
    }

    /// Collapse into an `Option`, treating degradation as a miss
    pub fn into_option(self) -> Option<T> {
        match self {
            Lookup::Hit(value) => Some(value),
            Lookup::Miss | Lookup::Degraded(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Hit(value) => Lookup::Hit(f(value)),
            Lookup::Miss => Lookup::Miss,
            Lookup::Degraded(err) => Lookup::Degraded(err),
        }
    }
}

impl<T> From<Result<Option<T>>> for Lookup<T> {
    fn from(result: Result<Option<T>>) -> Self {
        match result {
            Ok(Some(value)) => Lookup::Hit(value),
            Ok(None) => Lookup::Miss,
            Err(err) => Lookup::Degraded(err),
        }
    }
}

/// Longest expiry handed to a store, about a hundred years. Redis refuses
/// `EX` values whose millisecond deadline overflows.
pub const MAX_EXPIRY_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Store expiries are whole seconds, positive, and capped at [`MAX_EXPIRY_SECS`]
pub(crate) fn expiry_secs(ttl: Duration) -> u64 {
    ttl.as_secs().clamp(1, MAX_EXPIRY_SECS)
}

/// Compile a Redis `KEYS` pattern into a [`glob::Pattern`]
///
/// Redis escapes a metacharacter with `\` and negates a class with `[^..]`,
/// while `glob` uses `[x]` and `[!..]`. Runs of `*` collapse to one.
pub fn key_pattern(pattern: &str) -> Result<glob::Pattern> {
    let mut translated = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped @ ('*' | '?' | '[' | ']')) => {
                    translated.push('[');
                    translated.push(escaped);
                    translated.push(']');
                }
                Some(escaped) => translated.push(escaped),
                None => translated.push('\\'),
            },
            '*' => {
                while chars.peek() == Some(&'*') {
                    chars.next();
                }
                translated.push('*');
            }
            '[' => {
                translated.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    translated.push('!');
                }
            }
            other => translated.push(other),
        }
    }

    Ok(glob::Pattern::new(&translated)?)
}
