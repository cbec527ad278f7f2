//! Error types for content storage

use crate::hash::ContentHash;

/// Content store errors
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    /// No content stored under the hash
    #[error("content not found: {hash}")]
    NotFound { hash: ContentHash },

    /// Stored text no longer hashes to its key
    #[error("content corrupted: {hash}")]
    Corrupted { hash: ContentHash },

    /// Backend failure (I/O, connection, serialization)
    #[error("content backend error: {0}")]
    Backend(String),
}

impl ContentError {
    /// Check if error is a missing-content error
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
