//! Read-through content cache using moka
//!
//! Replay and audit viewers read the same prompts over and over. Content is
//! immutable once stored, so cached entries never need invalidation; the cache
//! only bounds memory.

use crate::error::ContentError;
use crate::hash::ContentHash;
use crate::store::{ContentStore, PutOutcome};
use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

/// Statistics for cache performance monitoring
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Number of entries in cache
    pub entry_count: u64,
}

/// Content store wrapper that caches `get` results by hash
#[derive(Debug, Clone)]
pub struct CachedContentStore {
    inner: Arc<dyn ContentStore>,
    cache: Cache<ContentHash, Arc<str>>,
}

impl CachedContentStore {
    /// Wrap `inner` with a cache of at most `max_capacity` entries
    #[must_use]
    pub fn new(inner: Arc<dyn ContentStore>, max_capacity: u64) -> Self {
        Self {
            inner,
            cache: Cache::new(max_capacity),
        }
    }

    /// Wrap `inner` with a cache whose entries idle out after `ttl`
    #[must_use]
    pub fn with_ttl(inner: Arc<dyn ContentStore>, max_capacity: u64, ttl: Duration) -> Self {
        Self {
            inner,
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_idle(ttl)
                .build(),
        }
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        self.cache.run_pending_tasks().await;
        CacheStats {
            entry_count: self.cache.entry_count(),
        }
    }
}

#[async_trait]
impl ContentStore for CachedContentStore {
    async fn put_text(&self, text: &str) -> Result<PutOutcome, ContentError> {
        let outcome = self.inner.put_text(text).await?;
        self.cache.insert(outcome.hash, Arc::from(text)).await;
        Ok(outcome)
    }

    async fn get(&self, hash: &ContentHash) -> Result<String, ContentError> {
        if let Some(text) = self.cache.get(hash).await {
            return Ok(text.to_string());
        }
        let text = self.inner.get(hash).await?;
        self.cache.insert(*hash, Arc::from(text.as_str())).await;
        Ok(text)
    }

    async fn contains(&self, hash: &ContentHash) -> Result<bool, ContentError> {
        if self.cache.contains_key(hash) {
            return Ok(true);
        }
        self.inner.contains(hash).await
    }

    async fn len(&self) -> Result<usize, ContentError> {
        self.inner.len().await
    }
}
