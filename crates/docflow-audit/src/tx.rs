//! Audit unit of work
//!
//! An [`AuditTx`] buffers every write of one logical operation. Nothing is
//! visible to readers until the owner hands it to [`AuditStore::commit`],
//! which applies all of it or none of it. Dropping a transaction discards it.
//!
//! [`AuditStore::commit`]: crate::store::AuditStore::commit

use crate::records::{InputRef, LlmRun, OutputRef, RunId, RunStatus, TokenUsage};
use chrono::{DateTime, Utc};
use docflow_content::ContentRecord;
use uuid::Uuid;

/// A staged write
#[derive(Debug, Clone, PartialEq)]
pub enum AuditOp {
    /// Stage a new run
    InsertRun(LlmRun),
    /// Stage a blob; a no-op if already stored
    StageContent(ContentRecord),
    /// Attach an input blob to a run
    InputRef(InputRef),
    /// Attach an output blob to a run
    OutputRef(OutputRef),
    /// Close a running run
    CompleteRun {
        run_id: RunId,
        usage: Option<TokenUsage>,
        status: RunStatus,
        completed_at: DateTime<Utc>,
    },
    /// Error row plus the rolling counter bump on its run, applied together
    RecordError {
        run_id: RunId,
        code: String,
        message: String,
        occurred_at: DateTime<Utc>,
    },
}

/// Buffered audit writes owned by the caller
#[derive(Debug)]
pub struct AuditTx {
    id: Uuid,
    ops: Vec<AuditOp>,
}

impl AuditTx {
    /// Begin an empty transaction
    #[must_use]
    pub fn begin() -> Self {
        Self {
            id: Uuid::new_v4(),
            ops: Vec::new(),
        }
    }

    /// Transaction ID
    #[inline]
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether nothing was staged
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of staged operations
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Staged operations, in order
    #[inline]
    #[must_use]
    pub fn ops(&self) -> &[AuditOp] {
        &self.ops
    }

    pub(crate) fn push(&mut self, op: AuditOp) {
        self.ops.push(op);
    }

    /// Consume the transaction, yielding its operations in staging order
    #[must_use]
    pub fn into_ops(self) -> Vec<AuditOp> {
        self.ops
    }

    /// Next free output ordinal for `run_id` within this transaction
    pub(crate) fn next_output_ordinal(&self, run_id: RunId) -> u32 {
        let staged = self
            .ops
            .iter()
            .filter(|op| matches!(op, AuditOp::OutputRef(r) if r.run_id == run_id))
            .count();
        u32::try_from(staged).unwrap_or(u32::MAX)
    }
}

impl Default for AuditTx {
    fn default() -> Self {
        Self::begin()
    }
}

/// Summary of an applied transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Runs added
    pub runs_inserted: usize,
    /// Runs moved to a terminal status
    pub runs_completed: usize,
    /// Error rows added
    pub errors_recorded: usize,
    /// Input and output reference rows added
    pub refs_written: usize,
    /// Blobs stored for the first time
    pub content_inserted: usize,
    /// Staged blobs that already existed and were not written again
    pub content_deduplicated: usize,
}
