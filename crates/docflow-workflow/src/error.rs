//! Error types for workflow definition, context, step and control operations
//!
//! Step-level failures (missing inputs, model errors, QA exhaustion,
//! contamination) do not surface here: they land in the step's state as a
//! [`FailureReason`](crate::state::FailureReason). These enums cover what the
//! engine itself cannot carry on from.

use crate::ports::PortError;
use crate::scope::ScopePath;
use crate::state::{StepStatus, TransitionError};
use crate::store::StoreError;

/// Definition load and validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    /// Malformed definition document
    #[error("parse error: {0}")]
    Parse(String),

    /// Definition file unreadable
    #[error("cannot read {path}: {message}")]
    Io { path: String, message: String },

    /// Reference to an undeclared document type
    #[error("{context}: unknown document type {doc_type}")]
    UnknownDocumentType { context: String, doc_type: String },

    /// Reference to an undeclared entity type
    #[error("{context}: unknown entity type {entity_type}")]
    UnknownEntityType { context: String, entity_type: String },

    /// Reference to an undeclared scope
    #[error("{context}: unknown scope {scope}")]
    UnknownScope { context: String, scope: String },

    /// Entity type claims the root scope
    #[error("entity type {entity_type} may not create the root scope")]
    RootScopeRedefined { entity_type: String },

    /// Two entity types create the same scope
    #[error("scope {scope} is created by more than one entity type")]
    DuplicateScope { scope: String },

    /// Ownership entry without a matching parent scope
    #[error("document type {doc_type} lists {entity_type} in may_own but is not its parent")]
    InvalidOwnership { doc_type: String, entity_type: String },

    /// `may_own` plus scope nesting must form a DAG
    #[error("ownership cycle through {node}")]
    OwnershipCycle { node: String },

    /// Acceptance required with no accepting role
    #[error("document type {doc_type} requires acceptance but names no accepting role")]
    MissingAcceptors { doc_type: String },

    /// Step ID used twice
    #[error("duplicate step id {step_id}")]
    DuplicateStepId { step_id: String },

    /// Document type with two producing steps
    #[error("document type {doc_type} produced by both {first} and {second}")]
    DuplicateProducer {
        doc_type: String,
        first: String,
        second: String,
    },

    /// Step scope disagrees with its document or block
    #[error("step {step_id} declares scope {step_scope}, document scope is {doc_scope}, enclosing scope is {enclosing_scope}")]
    ScopeMismatch {
        step_id: String,
        step_scope: String,
        doc_scope: String,
        enclosing_scope: String,
    },

    /// Inputs may come from the step's own scope or a strict ancestor only
    #[error("step {step_id} in scope {step_scope} cannot reach {doc_type} in scope {doc_scope}")]
    UnreachableInput {
        step_id: String,
        doc_type: String,
        doc_scope: String,
        step_scope: String,
    },

    /// Step reads its own output
    #[error("step {step_id} consumes the document it produces")]
    SelfInput { step_id: String },

    /// Item input outside an iteration block
    #[error("step {step_id} takes the iteration item but runs outside an iteration block")]
    ItemOutsideIteration { step_id: String },

    /// Malformed iteration block
    #[error("iteration block {block_id}: {reason}")]
    InvalidIterationBlock { block_id: String, reason: String },
}

/// Engine configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Config file unreadable
    #[error("cannot read {path}: {message}")]
    Io { path: String, message: String },

    /// Malformed TOML
    #[error("invalid configuration: {0}")]
    Parse(String),

    /// Value out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Context state errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// Field not declared in the schema
    #[error("unknown context field {field}")]
    UnknownField { field: String },

    /// Value does not match the declared shape
    #[error("context field {field} expects {expected}, got {found}")]
    ShapeMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    /// No scope context at the path
    #[error("no scope context at {scope}")]
    ScopeNotFound { scope: ScopePath },
}

/// A request section carried raw model output outside a governed input document
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("contamination: {section} section of step {step_id} carries raw model output")]
pub struct ContaminationViolation {
    /// Step whose request was contaminated
    pub step_id: String,
    /// Offending request section
    pub section: &'static str,
}

/// Errors that abort a step execution without a step-level verdict
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The caller abandoned the execution; step state is left unchanged
    #[error("step {step_id} cancelled")]
    Cancelled { step_id: String },

    /// Prompt lookup failed
    #[error("prompt store: {0}")]
    Prompt(PortError),

    /// Document lookup failed
    #[error("document store: {0}")]
    Document(PortError),

    /// Context delta rejected
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Illegal state transition
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Step not in the workflow
    #[error("unknown step {step_id}")]
    UnknownStep { step_id: String },
}

/// Workflow executor and control API errors
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Definition invalid
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    /// Step execution aborted
    #[error(transparent)]
    Step(#[from] StepError),

    /// Context delta rejected
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Illegal state transition
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Instance store failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No stored instance with this ID
    #[error("instance not found: {instance_id}")]
    InstanceNotFound { instance_id: String },

    /// Instance was created by a different workflow
    #[error("instance {instance_id} belongs to {found}, engine runs {expected}")]
    WorkflowMismatch {
        instance_id: String,
        expected: String,
        found: String,
    },

    /// No step state at the scope
    #[error("no state for step {step_id} at {scope}")]
    StepNotFound { step_id: String, scope: ScopePath },

    /// No such iteration item
    #[error("no iteration item {item_id} for block {block_id}")]
    ItemNotFound { block_id: String, item_id: String },

    /// Operation not allowed in the step's status
    #[error("step {step_id} is {status}; cannot {action}")]
    InvalidState {
        step_id: String,
        status: StepStatus,
        action: &'static str,
    },

    /// Role missing from the acceptor list
    #[error("role {role} may not accept step {step_id}")]
    NotPermitted { role: String, step_id: String },

    /// Instance no longer accepts operations
    #[error("instance {instance_id} is archived")]
    Archived { instance_id: String },
}

impl WorkflowError {
    /// Check if retrying the same call may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Step(StepError::Cancelled { .. } | StepError::Prompt(_) | StepError::Document(_))
                | Self::Store(StoreError::Conflict { .. } | StoreError::Io(_))
        )
    }

    /// Check if the error names a missing instance, step or item
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::InstanceNotFound { .. } | Self::StepNotFound { .. } | Self::ItemNotFound { .. }
        )
    }
}
