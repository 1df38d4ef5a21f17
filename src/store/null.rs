use super::KeyValueStore;
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Store used when nothing is configured; every command reports unavailability
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStore;

impl NullStore {
    fn unavailable<T>() -> Result<T> {
        Err(CacheError::StoreUnavailable("no store configured".to_string()))
    }
}

#[async_trait]
impl KeyValueStore for NullStore {
    fn backend(&self) -> &'static str {
        "none"
    }

    async fn is_available(&self) -> bool {
        false
    }

    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Self::unavailable()
    }

    async fn set_with_expiry(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<()> {
        Self::unavailable()
    }

    async fn delete(&self, _key: &str) -> Result<bool> {
        Self::unavailable()
    }

    async fn exists(&self, _key: &str) -> Result<bool> {
        Self::unavailable()
    }

    async fn keys_matching(&self, _pattern: &str) -> Result<Vec<String>> {
        Self::unavailable()
    }

    async fn add_to_set(&self, _set_key: &str, _member: &str) -> Result<()> {
        Self::unavailable()
    }

    async fn members_of(&self, _set_key: &str) -> Result<Vec<String>> {
        Self::unavailable()
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool> {
        Self::unavailable()
    }
}
