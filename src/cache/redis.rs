//! Redis-backed shared cache.
//!
//! Uses a [`ConnectionManager`] so a dropped connection is re-established on
//! the next command. Each command runs under the configured deadline and a
//! timed-out command is reported as [`CacheError::Timeout`].

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::{CacheError, CacheLookup, SharedCache};

#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisCache {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)
            .map_err(|e| CacheError::Backend(format!("invalid redis url: {e}")))?;
        let conn = match tokio::time::timeout(timeout, ConnectionManager::new(client)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(CacheError::Backend(format!("redis connect failed: {e}"))),
            Err(_) => return Err(CacheError::Timeout(timeout)),
        };
        debug!(timeout_ms = timeout.as_millis() as u64, "redis cache connected");
        Ok(Self { conn, timeout })
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, CacheError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(op, error = %e, "redis command failed");
                Err(CacheError::Backend(format!("redis {op} failed: {e}")))
            }
            Err(_) => {
                warn!(op, timeout_ms = self.timeout.as_millis() as u64, "redis command timed out");
                Err(CacheError::Timeout(self.timeout))
            }
        }
    }
}

// Redis expiries have second granularity and reject zero.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl SharedCache for RedisCache {
    async fn get(&self, key: &str) -> CacheLookup {
        let mut conn = self.conn.clone();
        let result = self
            .bounded("GET", async move { conn.get::<_, Option<String>>(key).await })
            .await;
        match result {
            Ok(Some(value)) => CacheLookup::Found(value),
            Ok(None) => CacheLookup::NotFound,
            Err(e) => CacheLookup::Unavailable(e),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let secs = ttl_secs(ttl);
        self.bounded("SETEX", async move { conn.set_ex::<_, _, ()>(key, value, secs).await })
            .await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let secs = ttl_secs(ttl);
        let reply: Option<String> = self
            .bounded("SET NX", async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(secs)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        self.bounded("DEL", async move { conn.del::<_, i64>(key).await })
            .await
            .map(|_| ())
    }
}
