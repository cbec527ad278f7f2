//! Docflow Workflow
//!
//! Declarative document workflows: a validated definition, an instance
//! arena of scope contexts, and executors that drive each produce step
//! through clarification, stateless model attempts, QA and acceptance.
//!
//! # Core Concepts
//!
//! - [`ValidatedWorkflow`]: a definition that passed every load-time check
//! - [`WorkflowInstance`]: one run, indexed by [`ScopePath`]
//! - [`StepState`]: persisted step FSM with transition history
//! - [`ContextStateManager`]: schema-checked context deltas and rendering
//! - [`StepExecutor`] / [`WorkflowExecutor`]: resumable execution
//! - [`WorkflowService`]: control API with per-instance single writer
//!
//! # Example
//!
//! ```rust,ignore
//! let workflow = Arc::new(validate(WorkflowDefinition::load("workflow.yaml")?)?);
//! let steps = StepExecutor::new(model, audit, prompts, EngineConfig::default());
//! let service = WorkflowService::new(
//!     WorkflowExecutor::new(workflow, steps),
//!     Arc::new(MemoryInstanceStore::new()),
//! );
//! let (instance_id, result) = service.start("proj-1", None).await?;
//! ```

#![warn(unreachable_pub)]
#![warn(missing_docs)]

pub mod config;
pub mod context;
pub mod definition;
pub mod error;
pub mod executor;
pub mod gates;
pub mod instance;
pub mod lifecycle;
pub mod ports;
pub mod request;
pub mod scope;
pub mod service;
pub mod state;
pub mod step;
pub mod store;

pub use config::EngineConfig;
pub use context::{ContextDelta, ContextSchema, ContextState, ContextStateManager, FieldShape, FieldSpec, MergePolicy};
pub use definition::{
    validate, DocumentTypeDef, EntityTypeDef, InputSpec, IterateStep, ProduceStep, StepDef, ValidatedWorkflow,
    WorkflowDefinition, WorkflowRef,
};
pub use error::{ConfigError, ContaminationViolation, ContextError, DefinitionError, StepError, WorkflowError};
pub use executor::{Checkpoint, NoCheckpoint, PausePoint, PauseReason, WorkflowExecutor, WorkflowResult};
pub use gates::{
    ClarificationQuestion, DefaultTaskHandler, GateContext, HandlerRegistry, QaFinding, QaVerdict, Severity,
    TaskHandler,
};
pub use instance::{document_key, DocumentRecord, EntityItem, InstanceId, InstanceLifecycle, WorkflowInstance};
pub use lifecycle::DocumentLifecycle;
pub use ports::{DocumentStore, NullDocumentStore, PortError, PromptStore, PromptTemplate};
pub use request::{GatheredInput, PromptSection, RenderedContext, StepRequest, TranscriptGuard};
pub use scope::{ScopePath, ROOT_SCOPE};
pub use service::WorkflowService;
pub use state::{FailureReason, StepState, StepStatus, TransitionCause, TransitionRecord};
pub use step::{StepExecutor, StepResult};
pub use store::{InstanceStore, JsonFileInstanceStore, MemoryInstanceStore, StoreError};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
