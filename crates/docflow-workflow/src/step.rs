//! Step executor
//!
//! Runs one produce step in one scope context: gather inputs, clarification
//! gate, stateless model attempts with QA remediation, then the acceptance
//! gate. Every model call is one audit run committed on its own.

use crate::config::EngineConfig;
use crate::context::{ContextDelta, ContextState, ContextStateManager};
use crate::definition::{DocumentTypeDef, InputSpec, ProduceStep, ValidatedWorkflow};
use crate::error::StepError;
use crate::gates::{ClarificationQuestion, GateContext, HandlerRegistry, QaFinding, TaskHandler};
use crate::instance::{document_key, NewDocument, WorkflowInstance};
use crate::lifecycle::mark_dependents_stale;
use crate::ports::{DocumentStore, NullDocumentStore, PromptStore, PromptTemplate};
use crate::request::{GatheredInput, PromptSection, StepRequest, TranscriptGuard};
use crate::scope::ScopePath;
use crate::state::{Candidate, FailureReason, StepState, StepStatus, TransitionCause};
use docflow_audit::{
    invoke_bounded, AuditStore, AuditTx, CancelToken, ContentKind, ExecutionLogger, ModelClient, ModelError,
    ModelRequest, NewRun, RunId, RunStatus,
};
use docflow_content::ContentHash;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::Instrument;

/// Where a step execution stopped
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    /// Document accepted and stored
    Completed,
    /// Questions need answers before generation
    AwaitingClarification { questions: Vec<ClarificationQuestion> },
    /// Candidate needs a role to accept it
    AwaitingAcceptance { accepted_by: Vec<String> },
    /// Step failed for good
    Failed(FailureReason),
}

impl StepResult {
    /// Status the step was left in
    #[must_use]
    pub fn status(&self) -> StepStatus {
        match self {
            Self::Completed => StepStatus::Completed,
            Self::AwaitingClarification { .. } => StepStatus::AwaitingClarification,
            Self::AwaitingAcceptance { .. } => StepStatus::AwaitingAcceptance,
            Self::Failed(_) => StepStatus::Failed,
        }
    }
}

/// Output that passed QA in this execution
struct Passed {
    content: String,
    run_id: RunId,
}

/// Executes produce steps against an instance
#[derive(Debug, Clone)]
pub struct StepExecutor {
    model: Arc<dyn ModelClient>,
    audit: Arc<dyn AuditStore>,
    logger: ExecutionLogger,
    prompts: Arc<dyn PromptStore>,
    documents: Arc<dyn DocumentStore>,
    handlers: HandlerRegistry,
    context: ContextStateManager,
    config: EngineConfig,
}

impl StepExecutor {
    /// Executor with no document write-through and default handlers
    #[must_use]
    pub fn new(
        model: Arc<dyn ModelClient>,
        audit: Arc<dyn AuditStore>,
        prompts: Arc<dyn PromptStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            model,
            audit,
            logger: ExecutionLogger::new(),
            prompts,
            documents: Arc::new(NullDocumentStore),
            handlers: HandlerRegistry::new(),
            context: ContextStateManager::new(config.context_schema.clone()),
            config,
        }
    }

    /// Write completed documents through to `documents`
    #[must_use]
    pub fn with_documents(mut self, documents: Arc<dyn DocumentStore>) -> Self {
        self.documents = documents;
        self
    }

    /// Replace the task handler registry
    #[must_use]
    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Context manager built from the configured schema
    #[must_use]
    pub fn context_manager(&self) -> &ContextStateManager {
        &self.context
    }

    fn handler_for(&self, step: &ProduceStep) -> Arc<dyn TaskHandler> {
        self.handlers.resolve(step.handler.as_deref().unwrap_or(&step.task))
    }

    /// Run `step` at `scope` until it completes, fails or pauses
    ///
    /// Steps already completed, failed or awaiting acceptance are reported
    /// as they stand. Step-level failures are returned as
    /// [`StepResult::Failed`] and recorded in the step state.
    ///
    /// # Errors
    /// `StepError::Cancelled` when `cancel` fires during a model call; the
    /// step state is then restored to what it was before the call.
    /// Prompt or document store failures, context schema violations and
    /// illegal transitions abort the execution.
    pub async fn execute(
        &self,
        workflow: &ValidatedWorkflow,
        instance: &mut WorkflowInstance,
        step: &ProduceStep,
        scope: &ScopePath,
        cancel: Option<&CancelToken>,
    ) -> Result<StepResult, StepError> {
        let doc_def = workflow
            .document_type(&step.produces)
            .ok_or_else(|| StepError::UnknownStep {
                step_id: step.id.clone(),
            })?;
        let before = instance.step_entry(scope, &step.id).clone();

        match before.status {
            StepStatus::Completed => return Ok(StepResult::Completed),
            StepStatus::AwaitingAcceptance => {
                return Ok(StepResult::AwaitingAcceptance {
                    accepted_by: doc_def.accepted_by.clone(),
                })
            }
            _ => {}
        }
        if let Some(reason) = before.failure_reason() {
            return Ok(StepResult::Failed(reason));
        }

        let span = tracing::info_span!(
            "step",
            instance_id = %instance.instance_id,
            step_id = %step.id,
            scope = %scope,
        );
        self.run_step(workflow, doc_def, instance, step, scope, cancel, before)
            .instrument(span)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        workflow: &ValidatedWorkflow,
        doc_def: &DocumentTypeDef,
        instance: &mut WorkflowInstance,
        step: &ProduceStep,
        scope: &ScopePath,
        cancel: Option<&CancelToken>,
        before: StepState,
    ) -> Result<StepResult, StepError> {
        let inputs = match self.gather_inputs(workflow, instance, step, scope).await? {
            Ok(inputs) => inputs,
            Err(reason) => return fail(instance, scope, &step.id, reason),
        };
        let context = self.context.effective(instance, scope)?;
        let handler = self.handler_for(step);

        if let Some(paused) = self
            .clarification_gate(instance, step, scope, &context, &inputs, handler.as_ref())
            .await?
        {
            return Ok(paused);
        }

        let cause = match instance.step_entry(scope, &step.id).status {
            StepStatus::AwaitingClarification => Some(TransitionCause::AnswersReceived),
            StepStatus::Executing => None,
            _ => Some(TransitionCause::Entered),
        };
        if let Some(cause) = cause {
            let seq = instance.next_seq();
            instance
                .step_entry(scope, &step.id)
                .transition(StepStatus::Executing, cause, seq)?;
        }

        let role_prompt = self.prompts.get_role(&step.role).await.map_err(StepError::Prompt)?;
        let task_prompt = self.prompts.get_task(&step.task).await.map_err(StepError::Prompt)?;

        let outcome = self
            .attempt_loop(
                instance,
                step,
                scope,
                &context,
                &inputs,
                handler.as_ref(),
                (&role_prompt, &task_prompt),
                cancel,
            )
            .await;

        let passed = match outcome {
            Ok(Ok(passed)) => passed,
            Ok(Err(reason)) => return fail(instance, scope, &step.id, reason),
            Err(StepError::Cancelled { step_id }) => {
                *instance.step_entry(scope, &step.id) = before;
                tracing::info!("step execution cancelled; state restored");
                return Err(StepError::Cancelled { step_id });
            }
            Err(other) => return Err(other),
        };

        let depends_on: BTreeMap<String, ContentHash> = inputs
            .iter()
            .filter_map(|input| match input {
                GatheredInput::Document {
                    doc_type,
                    scope,
                    content_hash,
                    ..
                } => Some((document_key(scope, doc_type), *content_hash)),
                GatheredInput::Item { .. } => None,
            })
            .collect();
        let gate = GateContext {
            step_id: &step.id,
            role: &step.role,
            task: &step.task,
            doc_type: &step.produces,
            scope,
            context: &context,
            inputs: &inputs,
            attempt: instance.step_entry(scope, &step.id).attempts,
        };
        let context_delta = handler.context_delta(&gate, &passed.content);
        let candidate = Candidate {
            content_hash: ContentHash::of_text(&passed.content),
            content: passed.content,
            run_id: passed.run_id,
            depends_on,
            context_delta,
        };

        if doc_def.acceptance_required {
            let seq = instance.next_seq();
            let state = instance.step_entry(scope, &step.id);
            state.transition(
                StepStatus::AwaitingAcceptance,
                TransitionCause::QaVerdict { passed: true },
                seq,
            )?;
            state.candidate = Some(candidate);
            tracing::info!(accepted_by = ?doc_def.accepted_by, "step awaiting acceptance");
            return Ok(StepResult::AwaitingAcceptance {
                accepted_by: doc_def.accepted_by.clone(),
            });
        }

        self.commit_document(
            instance,
            step,
            scope,
            candidate,
            None,
            TransitionCause::QaVerdict { passed: true },
        )
        .await?;
        Ok(StepResult::Completed)
    }

    /// Resolve every declared input, nearest scope first
    ///
    /// The inner `Err` is a step-level failure.
    async fn gather_inputs(
        &self,
        workflow: &ValidatedWorkflow,
        instance: &WorkflowInstance,
        step: &ProduceStep,
        scope: &ScopePath,
    ) -> Result<Result<Vec<GatheredInput>, FailureReason>, StepError> {
        let mut gathered = Vec::with_capacity(step.inputs.len());
        for input in &step.inputs {
            match input {
                InputSpec::Document { doc_type, optional } => {
                    let doc_scope = workflow
                        .document_type(doc_type)
                        .and_then(|def| scope.nearest(&def.scope))
                        .unwrap_or_else(|| scope.clone());
                    if let Some(doc) = instance.document(&doc_scope, doc_type) {
                        gathered.push(GatheredInput::Document {
                            doc_type: doc_type.clone(),
                            scope: doc_scope,
                            content: doc.content.clone(),
                            content_hash: doc.content_hash,
                        });
                        continue;
                    }
                    let external = self
                        .documents
                        .get(doc_type, &doc_scope)
                        .await
                        .map_err(StepError::Document)?;
                    match external {
                        Some(content) => gathered.push(GatheredInput::Document {
                            doc_type: doc_type.clone(),
                            scope: doc_scope,
                            content_hash: ContentHash::of_text(&content),
                            content,
                        }),
                        None if *optional => {}
                        None => {
                            return Ok(Err(FailureReason::MissingInput {
                                doc_type: doc_type.clone(),
                                scope: doc_scope,
                            }))
                        }
                    }
                }
                InputSpec::Item => match instance.scope(scope).and_then(|ctx| ctx.item.as_ref()) {
                    Some(item) => gathered.push(GatheredInput::Item {
                        entity_type: item.entity_type.clone(),
                        item_id: item.id.clone(),
                        data: item.data.clone(),
                    }),
                    None => {
                        return Ok(Err(FailureReason::MissingInput {
                            doc_type: "iteration_item".into(),
                            scope: scope.clone(),
                        }))
                    }
                },
            }
        }
        Ok(Ok(gathered))
    }

    /// Pause on unanswered questions; `None` lets generation proceed
    async fn clarification_gate(
        &self,
        instance: &mut WorkflowInstance,
        step: &ProduceStep,
        scope: &ScopePath,
        context: &ContextState,
        inputs: &[GatheredInput],
        handler: &dyn TaskHandler,
    ) -> Result<Option<StepResult>, StepError> {
        let status = instance.step_entry(scope, &step.id).status;
        match status {
            StepStatus::Pending => {
                let gate = GateContext {
                    step_id: &step.id,
                    role: &step.role,
                    task: &step.task,
                    doc_type: &step.produces,
                    scope,
                    context,
                    inputs,
                    attempt: 0,
                };
                let questions = handler.clarification_questions(&gate).await;
                let answers = &instance.step_entry(scope, &step.id).answers;
                let unanswered: Vec<_> = questions
                    .iter()
                    .filter(|q| !answers.contains_key(&q.id))
                    .cloned()
                    .collect();
                if unanswered.is_empty() {
                    return Ok(None);
                }
                let seq = instance.next_seq();
                let state = instance.step_entry(scope, &step.id);
                state.transition(StepStatus::AwaitingClarification, TransitionCause::Entered, seq)?;
                state.questions = questions;
                tracing::info!(questions = unanswered.len(), "step awaiting clarification");
                Ok(Some(StepResult::AwaitingClarification { questions: unanswered }))
            }
            StepStatus::AwaitingClarification => {
                let state = instance.step_entry(scope, &step.id);
                let unanswered: Vec<_> = state.unanswered().into_iter().cloned().collect();
                if unanswered.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(StepResult::AwaitingClarification { questions: unanswered }))
                }
            }
            _ => Ok(None),
        }
    }

    fn build_request(
        &self,
        step: &ProduceStep,
        context: &ContextState,
        inputs: &[GatheredInput],
        findings: &[QaFinding],
        (role_prompt, task_prompt): (&PromptTemplate, &PromptTemplate),
    ) -> StepRequest {
        let rendered = self.context.render_for_prompt(context, &step.role, &step.task);
        let mut request = StepRequest::new(role_prompt.text.clone()).section(PromptSection::RenderedContext(rendered));
        for input in inputs {
            let section = match input {
                GatheredInput::Document {
                    doc_type,
                    scope,
                    content,
                    ..
                } => PromptSection::InputDocument {
                    doc_type: doc_type.clone(),
                    scope: scope.clone(),
                    content: content.clone(),
                },
                GatheredInput::Item {
                    entity_type,
                    item_id,
                    data,
                } => PromptSection::IterationItem {
                    entity_type: entity_type.clone(),
                    item_id: item_id.clone(),
                    data: data.clone(),
                },
            };
            request = request.section(section);
        }
        if !findings.is_empty() {
            request = request.section(PromptSection::QaFindings(findings.to_vec()));
        }
        request.section(PromptSection::CurrentInput(task_prompt.text.clone()))
    }

    /// Model attempts with QA remediation
    ///
    /// Outer `Err` aborts the execution, inner `Err` fails the step.
    #[allow(clippy::too_many_arguments)]
    async fn attempt_loop(
        &self,
        instance: &mut WorkflowInstance,
        step: &ProduceStep,
        scope: &ScopePath,
        context: &ContextState,
        inputs: &[GatheredInput],
        handler: &dyn TaskHandler,
        prompts: (&PromptTemplate, &PromptTemplate),
        cancel: Option<&CancelToken>,
    ) -> Result<Result<Passed, FailureReason>, StepError> {
        let max_attempts = self.config.max_qa_attempts.max(1);
        let model = step.model.clone().unwrap_or_else(|| self.config.default_model.clone());
        let mut guard = TranscriptGuard::new();
        let mut findings = instance.step_entry(scope, &step.id).feedback.clone();

        loop {
            let attempt = instance.step_entry(scope, &step.id).attempts;
            if attempt >= max_attempts {
                tracing::warn!(attempts = attempt, "QA remediation exhausted");
                return Ok(Err(FailureReason::QaRemediationExhausted {
                    attempts: attempt,
                    findings,
                }));
            }

            let request = self.build_request(step, context, inputs, &findings, prompts);
            if let Err(violation) = guard.check(&step.id, &request) {
                return Ok(Err(FailureReason::Contamination {
                    section: violation.section.to_string(),
                }));
            }
            let attempt = attempt + 1;
            instance.step_entry(scope, &step.id).attempts = attempt;

            let model_request = ModelRequest {
                system_prompt: request.system_prompt.clone(),
                user_prompt: request.user_prompt(),
                model: model.clone(),
                params: self.config.model_params.clone(),
            };
            let mut tx = AuditTx::begin();
            let run_id = self.start_logged_run(
                &mut tx,
                instance,
                step,
                scope,
                &request,
                &model_request,
                prompts,
                &findings,
                attempt,
            );

            let result = invoke_bounded(self.model.as_ref(), &model_request, self.config.model_timeout(), cancel).await;
            instance.step_entry(scope, &step.id).last_run_id = Some(run_id);

            let response = match result {
                Ok(response) => response,
                Err(ModelError::Cancelled) => {
                    self.logger.abandon_run(&mut tx, run_id, RunStatus::Cancelled);
                    self.commit(tx, run_id).await;
                    return Err(StepError::Cancelled {
                        step_id: step.id.clone(),
                    });
                }
                Err(err) => {
                    tracing::warn!(run_id = %run_id, attempt, error = %err, "model invocation failed");
                    self.logger.log_error(&mut tx, run_id, err.code(), err.to_string());
                    self.logger.abandon_run(&mut tx, run_id, RunStatus::Error);
                    self.commit(tx, run_id).await;
                    return Ok(Err(FailureReason::ModelInvocation {
                        code: err.code().to_string(),
                        message: err.to_string(),
                    }));
                }
            };

            self.logger.add_output(&mut tx, run_id, ContentKind::RawText, &response.text);
            let gate = GateContext {
                step_id: &step.id,
                role: &step.role,
                task: &step.task,
                doc_type: &step.produces,
                scope,
                context,
                inputs,
                attempt,
            };
            let verdict = handler.evaluate(&gate, &response.text).await;
            if !verdict.passed {
                if let Ok(json) = serde_json::to_string(&verdict.findings) {
                    self.logger.add_output(&mut tx, run_id, ContentKind::QaFindings, &json);
                }
            }
            self.logger.complete_run(&mut tx, run_id, response.usage, RunStatus::Success);
            self.commit(tx, run_id).await;
            guard.record_output(&response.text);

            if verdict.passed {
                tracing::info!(run_id = %run_id, attempt, "QA passed");
                return Ok(Ok(Passed {
                    content: response.text,
                    run_id,
                }));
            }
            tracing::info!(run_id = %run_id, attempt, findings = verdict.findings.len(), "QA veto");
            findings = verdict.findings;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn start_logged_run(
        &self,
        tx: &mut AuditTx,
        instance: &WorkflowInstance,
        step: &ProduceStep,
        scope: &ScopePath,
        request: &StepRequest,
        model_request: &ModelRequest,
        (role_prompt, task_prompt): (&PromptTemplate, &PromptTemplate),
        findings: &[QaFinding],
        attempt: u32,
    ) -> RunId {
        let run = NewRun::new(
            model_request.model.clone(),
            step.role.clone(),
            step.produces.clone(),
            instance.correlation_id.clone(),
        )
        .with_parameters(model_request.params.clone())
        .with_metadata("role_prompt", role_prompt.fingerprint())
        .with_metadata("task_prompt", task_prompt.fingerprint())
        .with_metadata("instance_id", instance.instance_id.to_string())
        .with_metadata("step_id", step.id.clone())
        .with_metadata("scope", scope.to_string())
        .with_metadata("attempt", attempt.to_string());
        let run_id = self.logger.start_run(tx, run);

        let mut ordinal = 0;
        let mut add = |tx: &mut AuditTx, kind: ContentKind, text: &str| {
            self.logger.add_input(tx, run_id, kind, text, ordinal);
            ordinal += 1;
        };
        add(tx, ContentKind::SystemPrompt, &model_request.system_prompt);
        add(tx, ContentKind::UserPrompt, &model_request.user_prompt);
        for section in &request.sections {
            match section {
                PromptSection::InputDocument { content, .. } => add(tx, ContentKind::ContextDoc, content),
                PromptSection::RenderedContext(rendered) => add(tx, ContentKind::ContextState, rendered.as_str()),
                PromptSection::CurrentInput(text) => add(tx, ContentKind::TaskPrompt, text),
                PromptSection::IterationItem { data, .. } => add(tx, ContentKind::ContextDoc, &data.to_string()),
                PromptSection::QaFindings(_) => {}
            }
        }
        if !findings.is_empty() {
            if let Ok(json) = serde_json::to_string(findings) {
                add(tx, ContentKind::QaFindings, &json);
            }
        }
        run_id
    }

    /// Commit an audit transaction; failures never stop the step
    async fn commit(&self, tx: AuditTx, run_id: RunId) {
        if let Err(err) = self.audit.commit(tx).await {
            tracing::warn!(run_id = %run_id, error = %err, "audit commit failed");
        }
    }

    /// Write `candidate` as the step's document and complete the step
    ///
    /// Writes through to the document store first, then records the new
    /// version, marks dependents stale and merges the context delta.
    ///
    /// # Errors
    /// Document store failures, context schema violations or an illegal
    /// transition.
    pub(crate) async fn commit_document(
        &self,
        instance: &mut WorkflowInstance,
        step: &ProduceStep,
        scope: &ScopePath,
        candidate: Candidate,
        accepted_by: Option<String>,
        cause: TransitionCause,
    ) -> Result<(), StepError> {
        self.documents
            .put(&step.produces, scope, &candidate.content)
            .await
            .map_err(StepError::Document)?;

        if let Some(delta) = candidate.context_delta.as_ref().filter(|d| !d.is_empty()) {
            self.merge_delta(instance, scope, delta)?;
        }
        let record = instance.write_document(
            scope,
            NewDocument {
                doc_type: step.produces.clone(),
                content: candidate.content,
                produced_by: Some(candidate.run_id),
                depends_on: candidate.depends_on,
                accepted_by,
            },
        );
        let key = record.key();
        let hash = record.content_hash;
        let version = record.version;
        mark_dependents_stale(instance, &key, hash);

        let seq = instance.next_seq();
        let state = instance.step_entry(scope, &step.id);
        state.transition(StepStatus::Completed, cause, seq)?;
        state.candidate = None;
        state.feedback.clear();
        tracing::info!(document = %key, version, "step completed");
        Ok(())
    }

    fn merge_delta(
        &self,
        instance: &mut WorkflowInstance,
        scope: &ScopePath,
        delta: &ContextDelta,
    ) -> Result<(), StepError> {
        self.context.merge(instance, scope, delta)?;
        Ok(())
    }
}

fn fail(
    instance: &mut WorkflowInstance,
    scope: &ScopePath,
    step_id: &str,
    reason: FailureReason,
) -> Result<StepResult, StepError> {
    let seq = instance.next_seq();
    let state = instance.step_entry(scope, step_id);
    state.transition(StepStatus::Failed, TransitionCause::Failure, seq)?;
    state.failure = Some(reason.clone());
    tracing::warn!(step_id, scope = %scope, reason = %reason, "step failed");
    Ok(StepResult::Failed(reason))
}
