//! Docflow Content Store
//!
//! Content-addressed, write-once storage of the text blobs that flow through
//! model invocations: system prompts, user prompts, context documents and
//! outputs.
//!
//! # Core Concepts
//!
//! - [`ContentHash`]: SHA-256 digest used as the storage key
//! - [`ContentStore`]: async `put`/`get` contract, idempotent and append-only
//! - [`MemoryContentStore`]: concurrent in-memory backend
//! - [`CachedContentStore`]: moka read cache in front of any backend
//!
//! # Example
//!
//! ```rust,ignore
//! use docflow_content::{ContentStore, MemoryContentStore};
//!
//! let store = MemoryContentStore::new();
//! let hash = store.put("You are the Product Manager.").await?;
//! assert_eq!(store.get(&hash).await?, "You are the Product Manager.");
//! ```

#![warn(unreachable_pub)]
#![warn(missing_docs)]

mod cache;
mod error;
mod hash;
mod store;

pub use cache::{CacheStats, CachedContentStore};
pub use error::ContentError;
pub use hash::{ContentHash, HashError};
pub use store::{ContentRecord, ContentStore, MemoryContentStore, PutOutcome};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
