//! Cache backend implementations.

use super::key::CacheKey;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

/// A stored response. Entries are never expired or evicted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub response: String,
    pub stored_at: SystemTime,
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;
    async fn put(&self, key: &CacheKey, response: &str) -> Result<()>;
    async fn len(&self) -> Result<usize>;
    fn name(&self) -> &'static str;
}

/// Unbounded in-memory cache that lives as long as the process.
///
/// There is no TTL and no size bound, so memory grows with the number of distinct
/// successful jobs.
#[derive(Default)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<CacheKey, CacheEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &CacheKey, response: &str) -> Result<()> {
        let entry = CacheEntry {
            key: key.clone(),
            response: response.to_string(),
            stored_at: SystemTime::now(),
        };
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), entry);
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.read().unwrap_or_else(|e| e.into_inner()).len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Backend that stores nothing; used when caching is disabled.
pub struct NullCache;

impl NullCache {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for NullCache {
    async fn get(&self, _: &CacheKey) -> Result<Option<CacheEntry>> {
        Ok(None)
    }
    async fn put(&self, _: &CacheKey, _: &str) -> Result<()> {
        Ok(())
    }
    async fn len(&self) -> Result<usize> {
        Ok(0)
    }
    fn name(&self) -> &'static str {
        "null"
    }
}
