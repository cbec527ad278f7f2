//! Error types for audit storage and replay

use crate::model::ModelError;
use crate::records::{ContentKind, RunId};
use docflow_content::{ContentError, ContentHash};

/// Audit store errors
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Unknown run id
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: RunId },

    /// Run id inserted twice
    #[error("run already exists: {run_id}")]
    DuplicateRun { run_id: RunId },

    /// Terminal status may only be written once
    #[error("run already completed: {run_id}")]
    RunAlreadyCompleted { run_id: RunId },

    /// Reference row points at content that is neither stored nor staged
    #[error("referenced content missing: {hash}")]
    MissingContent { hash: ContentHash },

    /// Staged content does not hash to its key
    #[error("staged content does not match hash {hash}")]
    ContentMismatch { hash: ContentHash },

    /// Content store failure
    #[error("content error: {0}")]
    Content(#[from] ContentError),

    /// Snapshot encode/decode failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Snapshot I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuditError {
    /// Check if error is an unknown-run error
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::RunNotFound { .. })
    }
}

/// Replay and reconstruction errors
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// Unknown run id
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: RunId },

    /// Two input refs share an ordinal; order cannot be reconstructed
    #[error("ambiguous input ordering for run {run_id}: ordinal {ordinal} used {count} times")]
    AmbiguousOrdering {
        run_id: RunId,
        ordinal: u32,
        count: usize,
    },

    /// Stored text no longer hashes to the referenced hash
    #[error("integrity violation for run {run_id} input {ordinal}: expected {expected}, got {actual}")]
    IntegrityViolation {
        run_id: RunId,
        ordinal: u32,
        expected: ContentHash,
        actual: ContentHash,
    },

    /// A prompt the model call needs was never logged
    #[error("run {run_id} has no {kind} input; cannot re-execute")]
    IncompleteInputs { run_id: RunId, kind: ContentKind },

    /// The re-execution itself failed; the replay run is logged as an error
    #[error("replay {replay_run_id} of {original_run_id} failed: {source}")]
    Model {
        original_run_id: RunId,
        replay_run_id: RunId,
        #[source]
        source: ModelError,
    },

    /// Audit store failure
    #[error("audit error: {0}")]
    Audit(AuditError),
}

impl From<AuditError> for ReplayError {
    fn from(value: AuditError) -> Self {
        match value {
            AuditError::RunNotFound { run_id } => Self::RunNotFound { run_id },
            other => Self::Audit(other),
        }
    }
}

impl From<ContentError> for ReplayError {
    fn from(value: ContentError) -> Self {
        Self::Audit(AuditError::Content(value))
    }
}
