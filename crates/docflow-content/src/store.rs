//! Content stores
//!
//! A [`ContentStore`] maps [`ContentHash`] to text. It is write-once and
//! append-only: there is no update or delete operation, and storing the same
//! text twice is a no-op that yields the same hash.

use crate::error::ContentError;
use crate::hash::ContentHash;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One stored blob (`llm_content` row)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    /// SHA-256 of `content_text`
    pub content_hash: ContentHash,
    /// The stored text
    pub content_text: String,
}

impl ContentRecord {
    /// Build a record, computing the hash of `text`
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        let content_text = text.into();
        Self {
            content_hash: ContentHash::of_text(&content_text),
            content_text,
        }
    }

    /// Whether the stored text still hashes to the stored key
    #[must_use]
    pub fn verify(&self) -> bool {
        self.content_hash.matches(&self.content_text)
    }
}

/// Result of a `put`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    /// Key of the content
    pub hash: ContentHash,
    /// `false` when the content was already present and the write was a no-op
    pub inserted: bool,
}

/// Content-addressed, write-once text storage
///
/// Implementations must be safe under concurrent `put` of identical content:
/// exactly one row may exist per hash.
#[async_trait]
pub trait ContentStore: Send + Sync + std::fmt::Debug {
    /// Store `text` (idempotent) and report whether a row was created
    async fn put_text(&self, text: &str) -> Result<PutOutcome, ContentError>;

    /// Fetch the text stored under `hash`
    ///
    /// # Errors
    /// `ContentError::NotFound` if no content exists for `hash`.
    async fn get(&self, hash: &ContentHash) -> Result<String, ContentError>;

    /// Whether `hash` is present
    async fn contains(&self, hash: &ContentHash) -> Result<bool, ContentError>;

    /// Number of distinct blobs stored
    async fn len(&self) -> Result<usize, ContentError>;

    /// Store `text` and return its hash
    async fn put(&self, text: &str) -> Result<ContentHash, ContentError> {
        Ok(self.put_text(text).await?.hash)
    }
}

/// In-memory content store
///
/// Insert-if-absent on the hash key stands in for a unique constraint.
#[derive(Debug, Default, Clone)]
pub struct MemoryContentStore {
    blobs: Arc<DashMap<ContentHash, Arc<str>>>,
}

impl MemoryContentStore {
    /// Create an empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from exported records
    ///
    /// # Errors
    /// `ContentError::Corrupted` if a record's text does not hash to its key.
    pub fn from_records(records: impl IntoIterator<Item = ContentRecord>) -> Result<Self, ContentError> {
        let store = Self::new();
        for record in records {
            if !record.verify() {
                return Err(ContentError::Corrupted {
                    hash: record.content_hash,
                });
            }
            store
                .blobs
                .insert(record.content_hash, Arc::from(record.content_text));
        }
        Ok(store)
    }

    /// Export every record, ordered by hash
    #[must_use]
    pub fn records(&self) -> Vec<ContentRecord> {
        let mut records: Vec<ContentRecord> = self
            .blobs
            .iter()
            .map(|entry| ContentRecord {
                content_hash: *entry.key(),
                content_text: entry.value().to_string(),
            })
            .collect();
        records.sort_by(|a, b| a.content_hash.cmp(&b.content_hash));
        records
    }

    /// Synchronous insert used by stores that embed this one
    pub fn insert(&self, text: &str) -> PutOutcome {
        let hash = ContentHash::of_text(text);
        match self.blobs.entry(hash) {
            Entry::Occupied(_) => PutOutcome {
                hash,
                inserted: false,
            },
            Entry::Vacant(slot) => {
                slot.insert(Arc::from(text));
                PutOutcome {
                    hash,
                    inserted: true,
                }
            }
        }
    }

    /// Synchronous lookup
    #[must_use]
    pub fn lookup(&self, hash: &ContentHash) -> Option<Arc<str>> {
        self.blobs.get(hash).map(|entry| Arc::clone(entry.value()))
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put_text(&self, text: &str) -> Result<PutOutcome, ContentError> {
        let outcome = self.insert(text);
        if outcome.inserted {
            tracing::trace!(hash = %outcome.hash.short(), bytes = text.len(), "content stored");
        }
        Ok(outcome)
    }

    async fn get(&self, hash: &ContentHash) -> Result<String, ContentError> {
        self.lookup(hash)
            .map(|text| text.to_string())
            .ok_or(ContentError::NotFound { hash: *hash })
    }

    async fn contains(&self, hash: &ContentHash) -> Result<bool, ContentError> {
        Ok(self.blobs.contains_key(hash))
    }

    async fn len(&self) -> Result<usize, ContentError> {
        Ok(self.blobs.len())
    }
}
