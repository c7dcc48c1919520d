//! Response memoization keyed by content fingerprint.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ResponseCache`] | Backend wrapper with hit/miss statistics |
//! | [`CacheBackend`] | Trait for cache storage |
//! | [`MemoryCache`] | Unbounded in-memory backend, lives for the whole process |
//! | [`NullCache`] | No-op backend for disabling caching |
//! | [`CacheKeyGenerator`] | Fingerprint from prompt plus attachments |
//!
//! Only successful responses are stored. Nothing is ever invalidated, so a
//! long-running process with many distinct jobs grows without bound.
//!
//! ```rust
//! use prompt_governor::cache::{CacheKeyGenerator, MemoryCache, ResponseCache};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> prompt_governor::Result<()> {
//! let cache = ResponseCache::new(Box::new(MemoryCache::new()));
//! let key = CacheKeyGenerator::new().generate("Summarize the report", &[]);
//! assert_eq!(cache.get(&key).await?, None);
//! cache.put(&key, "A short summary").await?;
//! assert_eq!(cache.get(&key).await?.as_deref(), Some("A short summary"));
//! # Ok(())
//! # }
//! ```

mod backend;
mod key;

pub use backend::{CacheBackend, CacheEntry, MemoryCache, NullCache};
pub use key::{CacheKey, CacheKeyGenerator};

use crate::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
}

impl AtomicStats {
    fn to_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
        }
    }
}

pub struct ResponseCache {
    backend: Box<dyn CacheBackend>,
    stats: AtomicStats,
}

impl ResponseCache {
    pub fn new(backend: Box<dyn CacheBackend>) -> Self {
        Self {
            backend,
            stats: AtomicStats::default(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Box::new(NullCache::new()))
    }

    pub async fn get(&self, key: &CacheKey) -> Result<Option<String>> {
        match self.backend.get(key).await? {
            Some(entry) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "cache hit");
                Ok(Some(entry.response))
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    pub async fn put(&self, key: &CacheKey, response: &str) -> Result<()> {
        self.backend.put(key, response).await?;
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn len(&self) -> Result<usize> {
        self.backend.len().await
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.to_stats()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }
}
