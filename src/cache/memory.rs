use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{CacheError, CacheLookup, SharedCache};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// Process-local cache for single-node deployments and tests.
///
/// Set-if-absent runs under the map lock, so it gives the same single-winner
/// guarantee as `SET NX` on a shared backend.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail as if the backend were down.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("in-memory cache marked unavailable".into()));
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let map = self.inner.lock().await;
        map.values().filter(|e| e.expires_at > now).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SharedCache for InMemoryCache {
    async fn get(&self, key: &str) -> CacheLookup {
        if let Err(e) = self.check_available() {
            return CacheLookup::Unavailable(e);
        }
        let now = Instant::now();
        let mut map = self.inner.lock().await;
        match map.get(key) {
            Some(entry) if entry.expires_at > now => CacheLookup::Found(entry.value.clone()),
            Some(_) => {
                map.remove(key);
                CacheLookup::NotFound
            }
            None => CacheLookup::NotFound,
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.check_available()?;
        let mut map = self.inner.lock().await;
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.check_available()?;
        let now = Instant::now();
        let mut map = self.inner.lock().await;
        // purge expired
        map.retain(|_, e| e.expires_at > now);
        if map.contains_key(key) {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check_available()?;
        self.inner.lock().await.remove(key);
        Ok(())
    }
}
