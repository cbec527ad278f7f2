//! Docflow Audit
//!
//! Transactional audit log of every model invocation, plus the replay engine
//! that rebuilds a run's exact inputs from content hashes.
//!
//! # Core Concepts
//!
//! - [`AuditTx`]: unit of work; runs, refs and error rows commit together
//! - [`ExecutionLogger`]: stages run records into a caller-owned transaction
//! - [`AuditStore`]: atomic commit plus the read queries
//! - [`ReplayEngine`]: reconstruct inputs, re-execute, compare
//! - [`ModelClient`]: the stateless model port, with [`invoke_bounded`]
//!   adding deadlines and cancellation
//!
//! # Example
//!
//! ```rust,ignore
//! let mut tx = AuditTx::begin();
//! let run = logger.start_run(&mut tx, NewRun::new("model", "pm", "discovery", corr));
//! logger.add_input(&mut tx, run, ContentKind::SystemPrompt, system, 0);
//! logger.complete_run(&mut tx, run, usage, RunStatus::Success);
//! store.commit(tx).await?;
//! ```

#![warn(unreachable_pub)]
#![warn(missing_docs)]

mod error;
mod logger;
mod model;
mod query;
mod records;
mod replay;
mod service;
mod store;
mod tx;

pub use error::{AuditError, ReplayError};
pub use logger::{ExecutionLogger, NewRun};
pub use model::{
    cancel_pair, invoke_bounded, CancelHandle, CancelToken, ModelClient, ModelError, ModelRequest,
    ModelResponse,
};
pub use query::RunQuery;
pub use records::{
    ContentKind, CorrelationId, InputRef, LlmRun, OutputRef, RunDetail, RunError, RunId, RunStatus,
    TokenUsage,
};
pub use replay::{
    OutputComparison, ReconstructedInput, ReconstructedInputs, ReplayComparison, ReplayEngine,
    ReplayOutcome,
};
pub use service::AuditService;
pub use store::{AuditSnapshot, AuditStore, MemoryAuditStore};
pub use tx::{AuditOp, AuditTx, CommitReceipt};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
