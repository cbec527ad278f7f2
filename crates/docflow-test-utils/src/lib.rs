//! Testing utilities for the Docflow workspace
//!
//! Scripted model clients, in-memory prompt and document stores, task
//! handlers with fixed behaviour, and a fixture workflow.

#![allow(missing_docs)]

mod fixtures;
mod handlers;
mod model;
mod stores;

pub use fixtures::{
    backlog_workflow, backlog_workflow_yaml, fixture_prompts, fixture_reply, task_marker, Harness, EPIC_BACKLOG,
};
pub use handlers::ScriptedHandler;
pub use model::{FnModelClient, ScriptedModelClient, SlowModelClient};
pub use stores::{FailingAuditStore, MemoryDocumentStore, MemoryPromptStore};
