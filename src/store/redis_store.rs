//! Redis-backed store

use super::{expiry_secs, KeyValueStore};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{Client, FromRedisValue};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// How long to stop trying to connect after a failed attempt
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(30);

/// Redis [`KeyValueStore`]
///
/// Constructing the store performs no I/O. The connection is opened on the
/// first command and shared afterwards; `ConnectionManager` reconnects on its
/// own once established. A failed initial connect puts the store into a
/// cooldown during which commands fail fast with `StoreUnavailable`.
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    connect_timeout: Duration,
    command_timeout: Duration,
    retry_after: Mutex<Option<Instant>>,
}

impl RedisStore {
    /// Create a store for `url` without connecting
    pub fn new(url: &str, connect_timeout: Duration, command_timeout: Duration) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| CacheError::Config(format!("Invalid Redis URL: {}", e)))?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            connect_timeout,
            command_timeout,
            retry_after: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        if let Some(conn) = self.connection.get() {
            return Ok(conn.clone());
        }

        if let Some(until) = *self.retry_after.lock() {
            if Instant::now() < until {
                return Err(CacheError::StoreUnavailable(
                    "Redis connection is cooling down after a failed attempt".to_string(),
                ));
            }
        }

        let client = self.client.clone();
        let connect = self.connection.get_or_try_init(|| async move {
            ConnectionManager::new(client).await.map_err(CacheError::from)
        });

        match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(conn)) => {
                *self.retry_after.lock() = None;
                info!("Connected to Redis");
                Ok(conn.clone())
            }
            Ok(Err(e)) => {
                warn!("Redis connection failed: {}", e);
                self.start_cooldown();
                Err(e)
            }
            Err(_) => {
                warn!("Redis connection timed out after {:?}", self.connect_timeout);
                self.start_cooldown();
                Err(CacheError::StoreUnavailable(format!(
                    "Redis connection timed out after {:?}",
                    self.connect_timeout
                )))
            }
        }
    }

    fn start_cooldown(&self) {
        *self.retry_after.lock() = Some(Instant::now() + RECONNECT_COOLDOWN);
    }

    async fn query<T: FromRedisValue + Send>(&self, op: &str, cmd: &redis::Cmd) -> Result<T> {
        let mut conn = self.connection().await?;

        match tokio::time::timeout(self.command_timeout, cmd.query_async(&mut conn)).await {
            Ok(result) => result.map_err(|e| {
                CacheError::StoreUnavailable(format!("Redis {} error: {}", op, e))
            }),
            Err(_) => Err(CacheError::StoreUnavailable(format!(
                "Redis {} timed out after {:?}",
                op, self.command_timeout
            ))),
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn is_available(&self) -> bool {
        self.query::<String>("PING", &redis::cmd("PING")).await.is_ok()
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.query("GET", redis::cmd("GET").arg(key)).await
    }

    async fn set_with_expiry(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.query(
            "SET",
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(expiry_secs(ttl)),
        )
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let deleted: i64 = self.query("DEL", redis::cmd("DEL").arg(key)).await?;
        Ok(deleted > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }

        let deleted: i64 = self.query("DEL", redis::cmd("DEL").arg(keys)).await?;
        Ok(deleted.max(0) as usize)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let count: i64 = self.query("EXISTS", redis::cmd("EXISTS").arg(key)).await?;
        Ok(count > 0)
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        self.query("KEYS", redis::cmd("KEYS").arg(pattern)).await
    }

    async fn add_to_set(&self, set_key: &str, member: &str) -> Result<()> {
        let _: i64 = self
            .query("SADD", redis::cmd("SADD").arg(set_key).arg(member))
            .await?;
        Ok(())
    }

    async fn members_of(&self, set_key: &str) -> Result<Vec<String>> {
        self.query("SMEMBERS", redis::cmd("SMEMBERS").arg(set_key))
            .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let updated: i64 = self
            .query("EXPIRE", redis::cmd("EXPIRE").arg(key).arg(expiry_secs(ttl)))
            .await?;
        Ok(updated > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_is_a_config_error() {
        let result = RedisStore::new("not a url", Duration::from_secs(1), Duration::from_secs(1));
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_server_degrades_then_cools_down() {
        // Port 1 is reserved and refuses connections
        let store = RedisStore::new(
            "redis://127.0.0.1:1",
            Duration::from_millis(500),
            Duration::from_millis(500),
        )
        .unwrap();

        assert!(matches!(
            store.get("k").await,
            Err(CacheError::StoreUnavailable(_))
        ));

        // Second attempt fails fast without reconnecting
        let started = Instant::now();
        assert!(store.get("k").await.is_err());
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(!store.is_available().await);
    }
}
