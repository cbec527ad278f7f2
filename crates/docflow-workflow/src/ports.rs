//! Consumed ports: prompt store and document store

use crate::scope::ScopePath;
use async_trait::async_trait;
use docflow_content::ContentHash;
use serde::{Deserialize, Serialize};

/// Port failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    /// Nothing stored under the ID
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Backend failure
    #[error("backend error: {0}")]
    Backend(String),
}

/// A versioned prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    /// Prompt name
    pub id: String,
    /// Prompt version
    pub version: String,
    /// Prompt text
    pub text: String,
}

impl PromptTemplate {
    /// Create template
    #[must_use]
    pub fn new(id: impl Into<String>, version: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            text: text.into(),
        }
    }

    /// `id@version#<hash prefix>`, recorded with every run that used it
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let hash = ContentHash::of_text(&self.text);
        format!("{}@{}#{}", self.id, self.version, hash.short())
    }
}

/// Role and task prompts
#[async_trait]
pub trait PromptStore: Send + Sync + std::fmt::Debug {
    /// Role prompt for `role`
    async fn get_role(&self, role: &str) -> Result<PromptTemplate, PortError>;

    /// Task prompt for `task`
    async fn get_task(&self, task: &str) -> Result<PromptTemplate, PortError>;
}

/// External document storage, written through on completion
#[async_trait]
pub trait DocumentStore: Send + Sync + std::fmt::Debug {
    /// Stored document, if any
    async fn get(&self, doc_type: &str, scope: &ScopePath) -> Result<Option<String>, PortError>;

    /// Store a completed document
    async fn put(&self, doc_type: &str, scope: &ScopePath, content: &str) -> Result<(), PortError>;
}

/// Document store that holds nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDocumentStore;

#[async_trait]
impl DocumentStore for NullDocumentStore {
    async fn get(&self, _doc_type: &str, _scope: &ScopePath) -> Result<Option<String>, PortError> {
        Ok(None)
    }

    async fn put(&self, _doc_type: &str, _scope: &ScopePath, _content: &str) -> Result<(), PortError> {
        Ok(())
    }
}
