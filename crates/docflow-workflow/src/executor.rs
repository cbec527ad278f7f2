//! Workflow executor
//!
//! Walks the validated step list in order. Completed steps are skipped, so
//! executing an interrupted instance again picks up where it stopped.
//! Iteration blocks open one child scope context per collection item and
//! run their nested steps there, one item at a time.
//!
//! A [`Checkpoint`] sees the instance after every step result and block
//! transition, so progress is durable before the next model call starts.

use crate::definition::{IterateStep, StepDef, ValidatedWorkflow};
use crate::error::WorkflowError;
use crate::gates::ClarificationQuestion;
use crate::instance::{EntityItem, InstanceLifecycle, WorkflowInstance};
use crate::scope::ScopePath;
use crate::state::{FailureReason, StepStatus, TransitionCause};
use crate::step::{StepExecutor, StepResult};
use async_trait::async_trait;
use docflow_audit::CancelToken;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Why execution paused
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PauseReason {
    /// Questions await answers
    Clarification { questions: Vec<ClarificationQuestion> },
    /// Document awaits acceptance by one of these roles
    Acceptance { accepted_by: Vec<String> },
}

/// The step waiting on a human
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PausePoint {
    /// Waiting step
    pub step_id: String,
    /// Scope the step runs at
    pub scope: ScopePath,
    /// What the step waits for
    pub reason: PauseReason,
}

/// Outcome of one executor pass
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowResult {
    /// Every step at every scope is completed
    Completed,
    /// Waiting on a human
    Paused(PausePoint),
    /// First unrecoverable step failure
    Failed {
        step_id: String,
        scope: ScopePath,
        reason: FailureReason,
    },
}

impl WorkflowResult {
    /// Whether the pass finished the workflow
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

enum Flow {
    Continue,
    Stop(WorkflowResult),
}

type FlowFuture<'a> = BoxFuture<'a, Result<Flow, WorkflowError>>;

/// Persists an instance part-way through a pass
#[async_trait]
pub trait Checkpoint: Send + Sync {
    /// Called after a step result or block transition was applied
    ///
    /// # Errors
    /// A failed save aborts the pass.
    async fn checkpoint(&self, instance: &mut WorkflowInstance) -> Result<(), WorkflowError>;
}

/// Keeps progress in memory only
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCheckpoint;

#[async_trait]
impl Checkpoint for NoCheckpoint {
    async fn checkpoint(&self, _instance: &mut WorkflowInstance) -> Result<(), WorkflowError> {
        Ok(())
    }
}

#[derive(Clone, Copy)]
struct Pass<'a> {
    cancel: Option<&'a CancelToken>,
    checkpoint: &'a dyn Checkpoint,
}

/// Drives one validated workflow over its instances
#[derive(Debug, Clone)]
pub struct WorkflowExecutor {
    workflow: Arc<ValidatedWorkflow>,
    steps: StepExecutor,
}

impl WorkflowExecutor {
    /// Create executor
    #[must_use]
    pub fn new(workflow: Arc<ValidatedWorkflow>, steps: StepExecutor) -> Self {
        Self { workflow, steps }
    }

    /// Workflow being driven
    #[must_use]
    pub fn workflow(&self) -> &ValidatedWorkflow {
        &self.workflow
    }

    /// Step executor used for produce steps
    #[must_use]
    pub fn step_executor(&self) -> &StepExecutor {
        &self.steps
    }

    /// Instance of this workflow, rooted at the project scope
    #[must_use]
    pub fn new_instance(&self, project_id: impl Into<String>) -> WorkflowInstance {
        WorkflowInstance::new(project_id, self.workflow.workflow_ref())
    }

    /// Reject instances of another workflow or that are archived
    ///
    /// # Errors
    /// `WorkflowMismatch` or `Archived`.
    pub fn check_instance(&self, instance: &WorkflowInstance) -> Result<(), WorkflowError> {
        let expected = self.workflow.workflow_ref();
        if instance.workflow != expected {
            return Err(WorkflowError::WorkflowMismatch {
                instance_id: instance.instance_id.to_string(),
                expected: expected.to_string(),
                found: instance.workflow.to_string(),
            });
        }
        if instance.is_archived() {
            return Err(WorkflowError::Archived {
                instance_id: instance.instance_id.to_string(),
            });
        }
        Ok(())
    }

    /// Run every step until the workflow completes, pauses or fails
    ///
    /// # Errors
    /// Instance checks, cancellation and engine errors. Step failures are
    /// a [`WorkflowResult::Failed`], not an error.
    pub async fn execute(
        &self,
        instance: &mut WorkflowInstance,
        cancel: Option<&CancelToken>,
    ) -> Result<WorkflowResult, WorkflowError> {
        self.execute_with(instance, cancel, &NoCheckpoint).await
    }

    /// [`execute`](Self::execute), handing progress to `checkpoint` as it happens
    ///
    /// # Errors
    /// As `execute`, plus checkpoint failures.
    pub async fn execute_with(
        &self,
        instance: &mut WorkflowInstance,
        cancel: Option<&CancelToken>,
        checkpoint: &dyn Checkpoint,
    ) -> Result<WorkflowResult, WorkflowError> {
        self.check_instance(instance)?;
        let root = ScopePath::root();
        let pass = Pass { cancel, checkpoint };
        let result = match self.run_list(self.workflow.steps(), &root, instance, pass).await? {
            Flow::Continue => WorkflowResult::Completed,
            Flow::Stop(result) => result,
        };
        instance.lifecycle = match &result {
            WorkflowResult::Completed => InstanceLifecycle::Completed,
            WorkflowResult::Failed { .. } => InstanceLifecycle::Failed,
            WorkflowResult::Paused(_) => InstanceLifecycle::Active,
        };
        tracing::info!(
            instance_id = %instance.instance_id,
            lifecycle = ?instance.lifecycle,
            "workflow pass finished"
        );
        Ok(result)
    }

    /// Run one iteration item of `block_id` under `parent`
    ///
    /// The block is left `partial` even when this was its last item; only a
    /// full [`execute`](Self::execute) completes it.
    ///
    /// # Errors
    /// `StepNotFound` for an unknown block, `ItemNotFound` when the
    /// collection has no such item, plus the errors of `execute`.
    pub async fn execute_item(
        &self,
        instance: &mut WorkflowInstance,
        parent: &ScopePath,
        block_id: &str,
        item_id: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<WorkflowResult, WorkflowError> {
        self.execute_item_with(instance, parent, block_id, item_id, cancel, &NoCheckpoint)
            .await
    }

    /// [`execute_item`](Self::execute_item) with a checkpoint
    ///
    /// # Errors
    /// As `execute_item`, plus checkpoint failures.
    pub async fn execute_item_with(
        &self,
        instance: &mut WorkflowInstance,
        parent: &ScopePath,
        block_id: &str,
        item_id: &str,
        cancel: Option<&CancelToken>,
        checkpoint: &dyn Checkpoint,
    ) -> Result<WorkflowResult, WorkflowError> {
        self.check_instance(instance)?;
        let pass = Pass { cancel, checkpoint };
        let Some(StepDef::Iterate(block)) = self.workflow.step(block_id) else {
            return Err(WorkflowError::StepNotFound {
                step_id: block_id.to_string(),
                scope: parent.clone(),
            });
        };
        let items = match self.collection_items(instance, parent, block) {
            Ok(items) => items,
            Err(reason) => {
                let failed = self.fail_block(instance, parent, block, reason)?;
                checkpoint.checkpoint(instance).await?;
                return Ok(failed);
            }
        };
        let Some(item) = items.iter().find(|item| item.id == item_id).cloned() else {
            return Err(WorkflowError::ItemNotFound {
                block_id: block_id.to_string(),
                item_id: item_id.to_string(),
            });
        };
        if instance.step_entry(parent, &block.id).status == StepStatus::Pending {
            let seq = instance.next_seq();
            instance.step_entry(parent, &block.id).transition(
                StepStatus::Partial,
                TransitionCause::ItemsProgressed {
                    completed: 0,
                    total: items.len(),
                },
                seq,
            )?;
            checkpoint.checkpoint(instance).await?;
        }
        match self.run_item(block, parent, item, instance, pass).await? {
            Flow::Continue => Ok(WorkflowResult::Completed),
            Flow::Stop(result) => Ok(result),
        }
    }

    fn run_list<'a>(
        &'a self,
        steps: &'a [StepDef],
        scope: &'a ScopePath,
        instance: &'a mut WorkflowInstance,
        pass: Pass<'a>,
    ) -> FlowFuture<'a> {
        async move {
            for step in steps {
                let flow = match step {
                    StepDef::Produce(produce) => {
                        let result = self
                            .steps
                            .execute(&self.workflow, instance, produce, scope, pass.cancel)
                            .await?;
                        pass.checkpoint.checkpoint(instance).await?;
                        step_flow(&produce.id, scope, result)
                    }
                    StepDef::Iterate(block) => self.run_block(block, scope, instance, pass).await?,
                };
                if let Flow::Stop(result) = flow {
                    return Ok(Flow::Stop(result));
                }
            }
            Ok(Flow::Continue)
        }
        .boxed()
    }

    async fn run_block(
        &self,
        block: &IterateStep,
        scope: &ScopePath,
        instance: &mut WorkflowInstance,
        pass: Pass<'_>,
    ) -> Result<Flow, WorkflowError> {
        let state = instance.step_entry(scope, &block.id);
        if state.status == StepStatus::Completed {
            return Ok(Flow::Continue);
        }
        if let Some(reason) = state.failure_reason() {
            return Ok(Flow::Stop(WorkflowResult::Failed {
                step_id: block.id.clone(),
                scope: scope.clone(),
                reason,
            }));
        }

        let items = match self.collection_items(instance, scope, block) {
            Ok(items) => items,
            Err(reason) => {
                let failed = self.fail_block(instance, scope, block, reason)?;
                pass.checkpoint.checkpoint(instance).await?;
                return Ok(Flow::Stop(failed));
            }
        };
        let total = items.len();
        if instance.step_entry(scope, &block.id).status == StepStatus::Pending && total > 0 {
            let seq = instance.next_seq();
            instance.step_entry(scope, &block.id).transition(
                StepStatus::Partial,
                TransitionCause::ItemsProgressed { completed: 0, total },
                seq,
            )?;
            pass.checkpoint.checkpoint(instance).await?;
        }

        for (done, item) in items.into_iter().enumerate() {
            if let Flow::Stop(result) = self.run_item(block, scope, item, instance, pass).await? {
                tracing::info!(block_id = %block.id, completed = done, total, "iteration paused");
                return Ok(Flow::Stop(result));
            }
        }

        let seq = instance.next_seq();
        instance.step_entry(scope, &block.id).transition(
            StepStatus::Completed,
            TransitionCause::ItemsProgressed { completed: total, total },
            seq,
        )?;
        pass.checkpoint.checkpoint(instance).await?;
        tracing::info!(block_id = %block.id, scope = %scope, total, "iteration block completed");
        Ok(Flow::Continue)
    }

    async fn run_item(
        &self,
        block: &IterateStep,
        parent: &ScopePath,
        item: EntityItem,
        instance: &mut WorkflowInstance,
        pass: Pass<'_>,
    ) -> Result<Flow, WorkflowError> {
        let child_scope = self
            .workflow
            .entity_type(&block.entity_type)
            .map(|def| def.creates_scope.clone())
            .unwrap_or_else(|| block.entity_type.clone());
        let child = parent.child(child_scope, item.id.clone());
        instance.ensure_scope(&child, Some(item));
        self.run_list(&block.steps, &child, instance, pass).await
    }

    /// Items of the block's collection, recorded on the declaring scope
    fn collection_items(
        &self,
        instance: &mut WorkflowInstance,
        scope: &ScopePath,
        block: &IterateStep,
    ) -> Result<Vec<EntityItem>, FailureReason> {
        let doc_def = self
            .workflow
            .document_type(&block.over)
            .ok_or_else(|| FailureReason::InvalidCollection {
                message: format!("unknown document type {}", block.over),
            })?;
        let doc_scope = scope.nearest(&doc_def.scope).unwrap_or_else(|| scope.clone());
        let field = doc_def.collection_field.as_deref().unwrap_or_default();
        let doc = instance
            .document(&doc_scope, &block.over)
            .ok_or_else(|| FailureReason::MissingInput {
                doc_type: block.over.clone(),
                scope: doc_scope.clone(),
            })?;
        let items = parse_collection(&doc.content, field, &block.entity_type)
            .map_err(|message| FailureReason::InvalidCollection { message })?;
        instance.set_entities(&doc_scope, &block.entity_type, items.clone());
        Ok(items)
    }

    fn fail_block(
        &self,
        instance: &mut WorkflowInstance,
        scope: &ScopePath,
        block: &IterateStep,
        reason: FailureReason,
    ) -> Result<WorkflowResult, WorkflowError> {
        let seq = instance.next_seq();
        let state = instance.step_entry(scope, &block.id);
        state.transition(StepStatus::Failed, TransitionCause::Failure, seq)?;
        state.failure = Some(reason.clone());
        tracing::warn!(block_id = %block.id, scope = %scope, reason = %reason, "iteration block failed");
        Ok(WorkflowResult::Failed {
            step_id: block.id.clone(),
            scope: scope.clone(),
            reason,
        })
    }
}

fn step_flow(step_id: &str, scope: &ScopePath, result: StepResult) -> Flow {
    let stop = |reason| {
        Flow::Stop(WorkflowResult::Paused(PausePoint {
            step_id: step_id.to_string(),
            scope: scope.clone(),
            reason,
        }))
    };
    match result {
        StepResult::Completed => Flow::Continue,
        StepResult::AwaitingClarification { questions } => stop(PauseReason::Clarification { questions }),
        StepResult::AwaitingAcceptance { accepted_by } => stop(PauseReason::Acceptance { accepted_by }),
        StepResult::Failed(reason) => Flow::Stop(WorkflowResult::Failed {
            step_id: step_id.to_string(),
            scope: scope.clone(),
            reason,
        }),
    }
}

/// Items of the JSON array at `field`; each needs a string or numeric `id`
fn parse_collection(content: &str, field: &str, entity_type: &str) -> Result<Vec<EntityItem>, String> {
    let value: serde_json::Value =
        serde_json::from_str(content).map_err(|e| format!("document is not JSON: {e}"))?;
    let array = value
        .get(field)
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| format!("field {field} is not an array"))?;
    let mut items = Vec::with_capacity(array.len());
    for (index, entry) in array.iter().enumerate() {
        let id = match entry.get("id") {
            Some(serde_json::Value::String(id)) => id.clone(),
            Some(serde_json::Value::Number(id)) => id.to_string(),
            _ => return Err(format!("{field}[{index}] has no id")),
        };
        if id.is_empty() || id.contains('/') {
            return Err(format!("{field}[{index}] has invalid id {id:?}"));
        }
        if items.iter().any(|item: &EntityItem| item.id == id) {
            return Err(format!("duplicate id {id} in {field}"));
        }
        items.push(EntityItem {
            id,
            entity_type: entity_type.to_string(),
            data: entry.clone(),
        });
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_items_need_unique_ids() {
        let items = parse_collection(r#"{"epics":[{"id":"E1"},{"id":2}]}"#, "epics", "epic").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].id, "2");
        assert_eq!(items[0].data["id"], "E1");

        assert!(parse_collection(r#"{"epics":[{"id":"E1"},{"id":"E1"}]}"#, "epics", "epic").is_err());
        assert!(parse_collection(r#"{"epics":[{"title":"x"}]}"#, "epics", "epic").is_err());
        assert!(parse_collection(r#"{"epics":[{"id":"a/b"}]}"#, "epics", "epic").is_err());
        assert!(parse_collection(r#"{"epics":{}}"#, "epics", "epic").is_err());
        assert!(parse_collection("not json", "epics", "epic").is_err());
    }

    #[test]
    fn empty_collection_is_valid() {
        assert!(parse_collection(r#"{"epics":[]}"#, "epics", "epic").unwrap().is_empty());
    }
}
