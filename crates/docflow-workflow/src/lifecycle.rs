//! Document lifecycle overlay
//!
//! A read-side view derived from step states and document records. `partial`
//! never auto-completes and `stale` never deletes or regenerates anything.

use crate::instance::{document_key, WorkflowInstance};
use crate::scope::ScopePath;
use crate::state::StepStatus;
use docflow_content::ContentHash;
use serde::{Deserialize, Serialize};

/// Lifecycle of a document slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentLifecycle {
    /// No document and no candidate
    Missing,
    /// A candidate is being generated or reviewed
    Generating,
    /// Some iteration items are done
    Partial,
    /// Current and accepted
    Complete,
    /// An input changed since generation
    Stale,
}

impl DocumentLifecycle {
    /// Stored lifecycle name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Generating => "generating",
            Self::Partial => "partial",
            Self::Complete => "complete",
            Self::Stale => "stale",
        }
    }
}

impl std::fmt::Display for DocumentLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of the document `step_id` produces at `scope`
#[must_use]
pub fn document_lifecycle(
    instance: &WorkflowInstance,
    scope: &ScopePath,
    step_id: &str,
    doc_type: &str,
) -> DocumentLifecycle {
    let step = instance.step(scope, step_id).map(|s| s.status);
    match (instance.document(scope, doc_type), step) {
        (Some(doc), _) if doc.stale => DocumentLifecycle::Stale,
        (_, Some(StepStatus::Partial)) => DocumentLifecycle::Partial,
        (
            _,
            Some(StepStatus::AwaitingClarification | StepStatus::Executing | StepStatus::AwaitingAcceptance),
        ) => DocumentLifecycle::Generating,
        (Some(_), _) => DocumentLifecycle::Complete,
        (None, _) => DocumentLifecycle::Missing,
    }
}

/// Lifecycle of an iteration block at `scope`, over its child items
#[must_use]
pub fn block_lifecycle(instance: &WorkflowInstance, scope: &ScopePath, block_id: &str) -> DocumentLifecycle {
    match instance.step(scope, block_id).map(|s| s.status) {
        Some(StepStatus::Completed) => DocumentLifecycle::Complete,
        Some(StepStatus::Partial) => DocumentLifecycle::Partial,
        Some(StepStatus::Pending | StepStatus::Failed) | None => DocumentLifecycle::Missing,
        Some(_) => DocumentLifecycle::Generating,
    }
}

/// Mark every document generated from an older version of `key` as stale
///
/// Only the `stale` flag changes. Returns the keys newly marked.
pub fn mark_dependents_stale(instance: &mut WorkflowInstance, key: &str, current: ContentHash) -> Vec<String> {
    let mut marked = Vec::new();
    for doc in instance.documents_mut() {
        let outdated = doc.depends_on.get(key).is_some_and(|hash| *hash != current);
        if outdated && !doc.stale {
            doc.stale = true;
            marked.push(doc.key());
        }
    }
    if !marked.is_empty() {
        tracing::info!(source = %key, stale = marked.len(), "dependent documents marked stale");
    }
    marked
}

/// Explicitly mark one document stale
///
/// Returns `false` when no such document exists.
pub fn mark_stale(instance: &mut WorkflowInstance, scope: &ScopePath, doc_type: &str) -> bool {
    let key = document_key(scope, doc_type);
    for doc in instance.documents_mut() {
        if doc.key() == key {
            doc.stale = true;
            return true;
        }
    }
    false
}
