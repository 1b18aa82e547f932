//! Shared cache used for encrypted sessions and idempotency records.
//!
//! Every backend reports lookups as a [`CacheLookup`] so callers can tell a
//! missing key apart from a degraded backend without inspecting error text.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;

pub use self::memory::InMemoryCache;
pub use self::redis::RedisCache;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("cache backend unavailable: {0}")]
    Backend(String),
}

/// Outcome of a single read.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Found(String),
    NotFound,
    Unavailable(CacheError),
}

impl CacheLookup {
    pub fn is_found(&self) -> bool {
        matches!(self, CacheLookup::Found(_))
    }
}

#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> CacheLookup;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Stores `value` only if `key` is absent. Returns `true` when this call
    /// created the key.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}
