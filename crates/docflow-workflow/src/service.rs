//! Workflow control API
//!
//! One writer per instance at a time, behind a per-instance async mutex.
//! Every operation works on a copy of the stored instance and publishes it
//! as a new snapshot once saved; readers only ever see published snapshots.
//! Executor passes publish after every step result, not only at the end.

use crate::context::ContextDelta;
use crate::definition::{ProduceStep, StepDef};
use crate::error::{StepError, WorkflowError};
use crate::executor::{Checkpoint, WorkflowExecutor, WorkflowResult};
use crate::gates::QaFinding;
use crate::instance::{InstanceId, InstanceLifecycle, WorkflowInstance};
use crate::lifecycle::{block_lifecycle, document_lifecycle, DocumentLifecycle};
use crate::scope::ScopePath;
use crate::state::{StepState, StepStatus, TransitionCause};
use crate::store::{InstanceStore, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use docflow_audit::CancelToken;
use moka::future::Cache;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Context field that collects clarification answers
const PRIOR_ANSWERS: &str = "prior_answers";

/// Published snapshots kept for readers; evicted ones reload from the store
const SNAPSHOT_CAPACITY: u64 = 1024;

/// Start, resume and steer workflow instances
#[derive(Debug)]
pub struct WorkflowService {
    executor: WorkflowExecutor,
    store: Arc<dyn InstanceStore>,
    /// Held only while some operation waits on or owns the instance
    locks: DashMap<InstanceId, Arc<Mutex<()>>>,
    snapshots: Cache<InstanceId, Arc<WorkflowInstance>>,
}

impl WorkflowService {
    /// Service over `store`
    #[must_use]
    pub fn new(executor: WorkflowExecutor, store: Arc<dyn InstanceStore>) -> Self {
        Self {
            executor,
            store,
            locks: DashMap::new(),
            snapshots: Cache::new(SNAPSHOT_CAPACITY),
        }
    }

    /// Executor driving passes
    #[must_use]
    pub fn executor(&self) -> &WorkflowExecutor {
        &self.executor
    }

    /// Instances with an operation in flight or waiting for one
    #[must_use]
    pub fn held_locks(&self) -> usize {
        self.locks.len()
    }

    async fn exclusive(&self, instance_id: InstanceId) -> Exclusive<'_> {
        let lock = self.locks.entry(instance_id).or_default().clone();
        Exclusive {
            locks: &self.locks,
            instance_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn load(&self, instance_id: InstanceId) -> Result<WorkflowInstance, WorkflowError> {
        match self.store.load(instance_id).await {
            Ok(instance) => Ok(instance),
            Err(StoreError::NotFound { .. }) => Err(WorkflowError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn load_writable(&self, instance_id: InstanceId) -> Result<WorkflowInstance, WorkflowError> {
        let instance = self.load(instance_id).await?;
        self.executor.check_instance(&instance)?;
        Ok(instance)
    }

    /// Save `instance` under the next revision and publish it
    ///
    /// The revision is rolled back when the save fails, so a later save
    /// of the same copy is not reported as a conflict.
    async fn save_and_publish(&self, instance: &mut WorkflowInstance) -> Result<Arc<WorkflowInstance>, WorkflowError> {
        let (revision, updated_at) = (instance.revision, instance.updated_at);
        instance.bump_revision();
        if let Err(err) = self.store.save(instance).await {
            instance.revision = revision;
            instance.updated_at = updated_at;
            return Err(err.into());
        }
        tracing::debug!(
            instance_id = %instance.instance_id,
            revision = instance.revision,
            "instance published"
        );
        let snapshot = Arc::new(instance.clone());
        self.snapshots.insert(snapshot.instance_id, snapshot.clone()).await;
        Ok(snapshot)
    }

    async fn publish(&self, mut instance: WorkflowInstance) -> Result<Arc<WorkflowInstance>, WorkflowError> {
        self.save_and_publish(&mut instance).await
    }

    /// Run the executor on a working copy, publishing as it goes
    ///
    /// Progress is published even when the pass ends in an error; a
    /// cancelled step has already been restored by the step executor.
    async fn run(
        &self,
        mut working: WorkflowInstance,
        cancel: Option<&CancelToken>,
    ) -> Result<WorkflowResult, WorkflowError> {
        let publisher = Publisher::new(self, &working);
        let outcome = self.executor.execute_with(&mut working, cancel, &publisher).await;
        publisher.checkpoint(&mut working).await?;
        outcome
    }

    /// Create an instance for `project_id` and run it
    ///
    /// # Errors
    /// Store failures and engine errors; see [`WorkflowExecutor::execute`].
    pub async fn start(
        &self,
        project_id: impl Into<String>,
        cancel: Option<&CancelToken>,
    ) -> Result<(InstanceId, WorkflowResult), WorkflowError> {
        let instance = self.executor.new_instance(project_id);
        let instance_id = instance.instance_id;
        let _exclusive = self.exclusive(instance_id).await;
        tracing::info!(
            instance_id = %instance_id,
            project_id = %instance.project_id,
            workflow = %instance.workflow,
            "workflow started"
        );
        let published = self.publish(instance).await?;
        let result = self.run(WorkflowInstance::clone(&published), cancel).await?;
        Ok((instance_id, result))
    }

    /// Run an existing instance from where it stopped
    ///
    /// # Errors
    /// `InstanceNotFound`, `Archived`, or engine errors.
    pub async fn resume(
        &self,
        instance_id: InstanceId,
        cancel: Option<&CancelToken>,
    ) -> Result<WorkflowResult, WorkflowError> {
        let _exclusive = self.exclusive(instance_id).await;
        let working = self.load_writable(instance_id).await?;
        self.run(working, cancel).await
    }

    /// Run one iteration item of a block
    ///
    /// # Errors
    /// As [`WorkflowExecutor::execute_item`].
    pub async fn run_item(
        &self,
        instance_id: InstanceId,
        parent: &ScopePath,
        block_id: &str,
        item_id: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<WorkflowResult, WorkflowError> {
        let _exclusive = self.exclusive(instance_id).await;
        let mut working = self.load_writable(instance_id).await?;
        let publisher = Publisher::new(self, &working);
        let outcome = self
            .executor
            .execute_item_with(&mut working, parent, block_id, item_id, cancel, &publisher)
            .await;
        publisher.checkpoint(&mut working).await?;
        outcome
    }

    /// Record clarification answers; the next run resumes generation
    ///
    /// Answers also merge into the `prior_answers` context field when the
    /// schema declares it.
    ///
    /// # Errors
    /// `InvalidState` unless the step awaits clarification.
    pub async fn submit_answers(
        &self,
        instance_id: InstanceId,
        scope: &ScopePath,
        step_id: &str,
        answers: BTreeMap<String, String>,
    ) -> Result<(), WorkflowError> {
        let _exclusive = self.exclusive(instance_id).await;
        let mut working = self.load_writable(instance_id).await?;
        let state = step_mut(&mut working, scope, step_id)?;
        expect_status(state, StepStatus::AwaitingClarification, "submit answers")?;
        state.answers.extend(answers.clone());
        let remaining = state.unanswered().len();

        let manager = self.executor.step_executor().context_manager();
        if manager.schema().field(PRIOR_ANSWERS).is_some() && !answers.is_empty() {
            let value = answers
                .into_iter()
                .map(|(k, v)| (k, serde_json::Value::String(v)))
                .collect::<serde_json::Map<_, _>>();
            let delta =
                ContextDelta::new("clarification_answers").set(PRIOR_ANSWERS, serde_json::Value::Object(value));
            manager.merge(&mut working, scope, &delta)?;
        }
        tracing::info!(instance_id = %instance_id, step_id, remaining, "clarification answers recorded");
        self.publish(working).await?;
        Ok(())
    }

    /// Accept the pending candidate as `role`
    ///
    /// # Errors
    /// `NotPermitted` when `role` is not an accepting role, `InvalidState`
    /// unless the step awaits acceptance.
    pub async fn accept(
        &self,
        instance_id: InstanceId,
        scope: &ScopePath,
        step_id: &str,
        role: &str,
    ) -> Result<(), WorkflowError> {
        let _exclusive = self.exclusive(instance_id).await;
        let mut working = self.load_writable(instance_id).await?;
        let step = self.produce_step(step_id)?;
        self.check_acceptor(step, role)?;
        let state = step_mut(&mut working, scope, step_id)?;
        expect_status(state, StepStatus::AwaitingAcceptance, "accept")?;
        let candidate = state.candidate.clone().ok_or_else(|| WorkflowError::InvalidState {
            step_id: step_id.to_string(),
            status: state.status,
            action: "accept without a candidate",
        })?;
        self.executor
            .step_executor()
            .commit_document(
                &mut working,
                step,
                scope,
                candidate,
                Some(role.to_string()),
                TransitionCause::Accepted { role: role.to_string() },
            )
            .await?;
        step_mut(&mut working, scope, step_id)?.accepted_by.push(role.to_string());
        tracing::info!(instance_id = %instance_id, step_id, role, "candidate accepted");
        self.publish(working).await?;
        Ok(())
    }

    /// Reject the pending candidate; the step returns to `pending` with the
    /// reason carried into its next attempt
    ///
    /// # Errors
    /// As [`accept`](Self::accept).
    pub async fn reject(
        &self,
        instance_id: InstanceId,
        scope: &ScopePath,
        step_id: &str,
        role: &str,
        reason: &str,
    ) -> Result<(), WorkflowError> {
        let _exclusive = self.exclusive(instance_id).await;
        let mut working = self.load_writable(instance_id).await?;
        let step = self.produce_step(step_id)?;
        self.check_acceptor(step, role)?;
        let seq = working.next_seq();
        let state = step_mut(&mut working, scope, step_id)?;
        expect_status(state, StepStatus::AwaitingAcceptance, "reject")?;
        state.transition(
            StepStatus::Pending,
            TransitionCause::Rejected { role: role.to_string() },
            seq,
        )?;
        state.feedback.push(QaFinding::error("rejected", reason));
        tracing::info!(instance_id = %instance_id, step_id, role, "candidate rejected");
        self.publish(working).await?;
        Ok(())
    }

    /// Move a failed step back to `pending`
    ///
    /// # Errors
    /// `InvalidState` unless the step failed.
    pub async fn retry(&self, instance_id: InstanceId, scope: &ScopePath, step_id: &str) -> Result<(), WorkflowError> {
        self.reopen(instance_id, scope, step_id, StepStatus::Failed, TransitionCause::Retry, "retry")
            .await
    }

    /// Move a completed step back to `pending`; its document is kept until
    /// the new version replaces it
    ///
    /// # Errors
    /// `InvalidState` unless the step completed.
    pub async fn regenerate(
        &self,
        instance_id: InstanceId,
        scope: &ScopePath,
        step_id: &str,
    ) -> Result<(), WorkflowError> {
        self.reopen(
            instance_id,
            scope,
            step_id,
            StepStatus::Completed,
            TransitionCause::Regenerate,
            "regenerate",
        )
        .await
    }

    async fn reopen(
        &self,
        instance_id: InstanceId,
        scope: &ScopePath,
        step_id: &str,
        from: StepStatus,
        cause: TransitionCause,
        action: &'static str,
    ) -> Result<(), WorkflowError> {
        let _exclusive = self.exclusive(instance_id).await;
        let mut working = self.load_writable(instance_id).await?;
        let seq = working.next_seq();
        let state = step_mut(&mut working, scope, step_id)?;
        expect_status(state, from, action)?;
        state.transition(StepStatus::Pending, cause, seq)?;
        working.lifecycle = InstanceLifecycle::Active;
        tracing::info!(instance_id = %instance_id, step_id, scope = %scope, action, "step reopened");
        self.publish(working).await?;
        Ok(())
    }

    /// Mark an instance archived; it can no longer be executed or changed
    ///
    /// # Errors
    /// `InstanceNotFound` or store failures.
    pub async fn archive(&self, instance_id: InstanceId) -> Result<(), WorkflowError> {
        let _exclusive = self.exclusive(instance_id).await;
        let mut working = self.load(instance_id).await?;
        if working.is_archived() {
            return Ok(());
        }
        working.lifecycle = InstanceLifecycle::Archived;
        tracing::info!(instance_id = %instance_id, "instance archived");
        self.publish(working).await?;
        self.snapshots.invalidate(&instance_id).await;
        Ok(())
    }

    /// Last published snapshot
    ///
    /// # Errors
    /// `InstanceNotFound` or store failures.
    pub async fn instance(&self, instance_id: InstanceId) -> Result<Arc<WorkflowInstance>, WorkflowError> {
        if let Some(snapshot) = self.snapshots.get(&instance_id).await {
            return Ok(snapshot);
        }
        let snapshot = Arc::new(self.load(instance_id).await?);
        if !snapshot.is_archived() {
            self.snapshots.insert(instance_id, snapshot.clone()).await;
        }
        Ok(snapshot)
    }

    /// # Errors
    /// Store failures.
    pub async fn list(&self) -> Result<Vec<InstanceId>, WorkflowError> {
        Ok(self.store.list().await?)
    }

    /// Persisted state of one step
    ///
    /// # Errors
    /// `InstanceNotFound` or `StepNotFound` when the step was never touched.
    pub async fn step_state(
        &self,
        instance_id: InstanceId,
        scope: &ScopePath,
        step_id: &str,
    ) -> Result<StepState, WorkflowError> {
        let snapshot = self.instance(instance_id).await?;
        snapshot
            .step(scope, step_id)
            .cloned()
            .ok_or_else(|| WorkflowError::StepNotFound {
                step_id: step_id.to_string(),
                scope: scope.clone(),
            })
    }

    /// Lifecycle of `doc_type` at `scope`, or of an iteration block by id
    ///
    /// # Errors
    /// `InstanceNotFound`, or `StepNotFound` when nothing produces `doc_type`.
    pub async fn document_lifecycle(
        &self,
        instance_id: InstanceId,
        scope: &ScopePath,
        doc_type: &str,
    ) -> Result<DocumentLifecycle, WorkflowError> {
        let snapshot = self.instance(instance_id).await?;
        let workflow = self.executor.workflow();
        if let Some(step) = workflow.producer_of(doc_type) {
            return Ok(document_lifecycle(&snapshot, scope, &step.id, doc_type));
        }
        if let Some(StepDef::Iterate(block)) = workflow.step(doc_type) {
            return Ok(block_lifecycle(&snapshot, scope, &block.id));
        }
        Err(WorkflowError::StepNotFound {
            step_id: doc_type.to_string(),
            scope: scope.clone(),
        })
    }

    fn produce_step(&self, step_id: &str) -> Result<&ProduceStep, WorkflowError> {
        match self.executor.workflow().step(step_id) {
            Some(StepDef::Produce(step)) => Ok(step),
            _ => Err(StepError::UnknownStep {
                step_id: step_id.to_string(),
            }
            .into()),
        }
    }

    fn check_acceptor(&self, step: &ProduceStep, role: &str) -> Result<(), WorkflowError> {
        let permitted = self
            .executor
            .workflow()
            .document_type(&step.produces)
            .is_some_and(|def| def.accepted_by.iter().any(|r| r == role));
        if permitted {
            Ok(())
        } else {
            Err(WorkflowError::NotPermitted {
                role: role.to_string(),
                step_id: step.id.clone(),
            })
        }
    }
}

/// Exclusive access to one instance; the lock entry goes away with the
/// last holder
struct Exclusive<'a> {
    locks: &'a DashMap<InstanceId, Arc<Mutex<()>>>,
    instance_id: InstanceId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Exclusive<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.instance_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Checkpoint that saves the working copy whenever it moved on since the
/// last save
struct Publisher<'a> {
    service: &'a WorkflowService,
    saved: parking_lot::Mutex<Arc<WorkflowInstance>>,
}

impl<'a> Publisher<'a> {
    fn new(service: &'a WorkflowService, saved: &WorkflowInstance) -> Self {
        Self {
            service,
            saved: parking_lot::Mutex::new(Arc::new(saved.clone())),
        }
    }
}

#[async_trait]
impl Checkpoint for Publisher<'_> {
    async fn checkpoint(&self, instance: &mut WorkflowInstance) -> Result<(), WorkflowError> {
        let unchanged = **self.saved.lock() == *instance;
        if unchanged {
            return Ok(());
        }
        let snapshot = self.service.save_and_publish(instance).await?;
        *self.saved.lock() = snapshot;
        Ok(())
    }
}

fn step_mut<'a>(
    instance: &'a mut WorkflowInstance,
    scope: &ScopePath,
    step_id: &str,
) -> Result<&'a mut StepState, WorkflowError> {
    instance
        .scope_mut(scope)
        .and_then(|ctx| ctx.steps.get_mut(step_id))
        .ok_or_else(|| WorkflowError::StepNotFound {
            step_id: step_id.to_string(),
            scope: scope.clone(),
        })
}

fn expect_status(state: &StepState, expected: StepStatus, action: &'static str) -> Result<(), WorkflowError> {
    if state.status == expected {
        Ok(())
    } else {
        Err(WorkflowError::InvalidState {
            step_id: state.step_id.clone(),
            status: state.status,
            action,
        })
    }
}
