//! Control API: answers, acceptance, retry, regenerate, durability

use docflow_audit::{MemoryAuditStore, ModelError, ModelResponse, TokenUsage};
use docflow_test_utils::{
    backlog_workflow, fixture_prompts, fixture_reply, task_marker, FnModelClient, Harness, ScriptedHandler,
};
use docflow_workflow::{
    ContextSchema, DocumentLifecycle, EngineConfig, FieldShape, FieldSpec, HandlerRegistry, InstanceLifecycle,
    JsonFileInstanceStore, MergePolicy, PauseReason, ScopePath, StepExecutor, StepStatus, TransitionCause,
    WorkflowError, WorkflowExecutor, WorkflowResult, WorkflowService,
};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn fixture_model() -> Arc<FnModelClient> {
    Arc::new(FnModelClient::text(fixture_reply))
}

fn calls_for(model: &FnModelClient, task: &str) -> usize {
    model
        .requests()
        .iter()
        .filter(|r| r.user_prompt.contains(&task_marker(task)))
        .count()
}

#[tokio::test]
async fn questions_pause_before_any_model_call() {
    let model = fixture_model();
    let handler = Arc::new(ScriptedHandler::asking(&[("audience", "Who is the primary audience?")]));
    let schema = ContextSchema::empty().with_field(
        "prior_answers",
        FieldSpec::new(FieldShape::Object, MergePolicy::MergeKeys),
    );
    let harness = Harness::build(
        model.clone(),
        backlog_workflow(false),
        HandlerRegistry::new().with("discovery", handler),
        EngineConfig::default().with_context_schema(schema),
    );
    let root = ScopePath::root();

    let (id, result) = harness.service.start("proj-1", None).await.unwrap();
    let WorkflowResult::Paused(pause) = result else {
        panic!("expected a pause, got {result:?}");
    };
    assert_eq!(pause.step_id, "discovery");
    let PauseReason::Clarification { questions } = pause.reason else {
        panic!("expected clarification");
    };
    assert_eq!(questions.len(), 1);
    assert_eq!(model.call_count(), 0);

    // still waiting; nothing runs
    assert!(matches!(
        harness.service.resume(id, None).await.unwrap(),
        WorkflowResult::Paused(_)
    ));
    assert_eq!(model.call_count(), 0);

    let answers = BTreeMap::from([("audience".to_string(), "support admins".to_string())]);
    harness
        .service
        .submit_answers(id, &root, "discovery", answers)
        .await
        .unwrap();
    assert!(harness.service.resume(id, None).await.unwrap().is_completed());

    let discovery = &model.requests()[0];
    assert!(discovery.user_prompt.contains("- audience: support admins"));
    let state = harness.service.step_state(id, &root, "discovery").await.unwrap();
    assert!(state
        .history
        .iter()
        .any(|t| t.to == StepStatus::Executing && t.cause == TransitionCause::AnswersReceived));
    assert_eq!(state.answers["audience"], "support admins");
}

#[tokio::test]
async fn answers_are_refused_unless_awaiting_clarification() {
    let harness = Harness::new(fixture_model(), false);
    let (id, _) = harness.service.start("proj-1", None).await.unwrap();
    let err = harness
        .service
        .submit_answers(id, &ScopePath::root(), "discovery", BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidState { status: StepStatus::Completed, .. }));
}

#[tokio::test]
async fn acceptance_checks_roles_and_carries_rejections() {
    let model = fixture_model();
    let harness = Harness::new(model.clone(), true);
    let root = ScopePath::root();
    let (id, _) = harness.service.start("proj-1", None).await.unwrap();

    let state = harness.service.step_state(id, &root, "epic_backlog").await.unwrap();
    assert_eq!(state.status, StepStatus::AwaitingAcceptance);
    assert!(state.candidate.is_some());
    assert!(harness.service.instance(id).await.unwrap().document(&root, "epic_backlog").is_none());
    assert_eq!(
        harness.service.document_lifecycle(id, &root, "epic_backlog").await.unwrap(),
        DocumentLifecycle::Generating
    );

    let err = harness.service.accept(id, &root, "epic_backlog", "developer").await.unwrap_err();
    assert!(matches!(err, WorkflowError::NotPermitted { ref role, .. } if role == "developer"));

    harness
        .service
        .reject(id, &root, "epic_backlog", "product_owner", "needs a billing epic")
        .await
        .unwrap();
    let state = harness.service.step_state(id, &root, "epic_backlog").await.unwrap();
    assert_eq!(state.status, StepStatus::Pending);
    assert_eq!(state.feedback.len(), 1);

    assert!(matches!(
        harness.service.resume(id, None).await.unwrap(),
        WorkflowResult::Paused(_)
    ));
    assert_eq!(calls_for(&model, "epic_backlog"), 2);
    let retried = model.requests().last().cloned().unwrap();
    assert!(retried.user_prompt.contains("- [rejected] needs a billing epic"));

    harness
        .service
        .accept(id, &root, "epic_backlog", "product_owner")
        .await
        .unwrap();
    assert!(harness.service.resume(id, None).await.unwrap().is_completed());

    let instance = harness.service.instance(id).await.unwrap();
    let backlog = instance.document(&root, "epic_backlog").unwrap();
    assert_eq!(backlog.accepted_by.as_deref(), Some("product_owner"));
    let state = instance.step(&root, "epic_backlog").unwrap();
    assert_eq!(state.accepted_by, vec!["product_owner".to_string()]);
    assert!(state.feedback.is_empty());
    assert!(state
        .history
        .iter()
        .any(|t| t.cause == TransitionCause::Rejected { role: "product_owner".into() }));
}

#[tokio::test]
async fn regenerating_an_input_marks_dependents_stale() {
    let discovery_runs = Arc::new(AtomicUsize::new(0));
    let counter = discovery_runs.clone();
    let model = Arc::new(FnModelClient::text(move |request| {
        if request.user_prompt.contains(&task_marker("discovery")) {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            format!(r#"{{"problem":"revision {n}"}}"#)
        } else {
            fixture_reply(request)
        }
    }));
    let harness = Harness::new(model.clone(), false);
    let root = ScopePath::root();
    let (id, _) = harness.service.start("proj-1", None).await.unwrap();

    let before = harness.service.instance(id).await.unwrap();
    let e1 = root.child("epic", "E1");
    let detail_before = before.document(&e1, "epic_detail").unwrap().content.clone();

    harness.service.regenerate(id, &root, "discovery").await.unwrap();
    assert_eq!(
        harness.service.instance(id).await.unwrap().lifecycle,
        InstanceLifecycle::Active
    );
    assert!(harness.service.resume(id, None).await.unwrap().is_completed());
    assert_eq!(discovery_runs.load(Ordering::SeqCst), 2);
    assert_eq!(model.call_count(), 5);

    let after = harness.service.instance(id).await.unwrap();
    let discovery = after.document(&root, "discovery").unwrap();
    assert_eq!(discovery.version, 2);
    assert_eq!(discovery.history.len(), 1);
    assert!(!discovery.stale);

    let backlog = after.document(&root, "epic_backlog").unwrap();
    assert!(backlog.stale);
    let detail = after.document(&e1, "epic_detail").unwrap();
    assert!(detail.stale);
    assert_eq!(detail.content, detail_before);
    assert_eq!(
        harness.service.document_lifecycle(id, &e1, "epic_detail").await.unwrap(),
        DocumentLifecycle::Stale
    );
}

#[tokio::test]
async fn retry_reruns_a_failed_step() {
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    let model = Arc::new(FnModelClient::new(move |request| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(ModelError::Provider {
                code: "overloaded".into(),
                message: "try again later".into(),
            });
        }
        Ok(ModelResponse {
            text: fixture_reply(request),
            usage: TokenUsage::new(100, 50),
        })
    }));
    let harness = Harness::new(model.clone(), false);
    let root = ScopePath::root();

    let (id, result) = harness.service.start("proj-1", None).await.unwrap();
    assert!(matches!(result, WorkflowResult::Failed { ref step_id, .. } if step_id == "discovery"));
    assert_eq!(
        harness.service.instance(id).await.unwrap().lifecycle,
        InstanceLifecycle::Failed
    );

    // failed steps stay failed until retried
    assert!(matches!(
        harness.service.resume(id, None).await.unwrap(),
        WorkflowResult::Failed { .. }
    ));
    assert_eq!(model.call_count(), 1);

    let err = harness.service.regenerate(id, &root, "discovery").await.unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidState { .. }));

    harness.service.retry(id, &root, "discovery").await.unwrap();
    assert!(harness.service.resume(id, None).await.unwrap().is_completed());
    assert_eq!(model.call_count(), 5);
    let state = harness.service.step_state(id, &root, "discovery").await.unwrap();
    assert!(state.history.iter().any(|t| t.cause == TransitionCause::Retry));
}

#[tokio::test]
async fn single_items_run_without_completing_the_block() {
    let model = fixture_model();
    let harness = Harness::new(model.clone(), true);
    let root = ScopePath::root();
    let (id, _) = harness.service.start("proj-1", None).await.unwrap();
    harness
        .service
        .accept(id, &root, "epic_backlog", "product_owner")
        .await
        .unwrap();

    let result = harness.service.run_item(id, &root, "per_epic", "E2", None).await.unwrap();
    assert!(result.is_completed());

    let instance = harness.service.instance(id).await.unwrap();
    assert!(instance.document(&root.child("epic", "E2"), "epic_detail").is_some());
    assert!(instance.document(&root.child("epic", "E1"), "epic_detail").is_none());
    assert_eq!(instance.step(&root, "per_epic").unwrap().status, StepStatus::Partial);
    assert_eq!(
        harness.service.document_lifecycle(id, &root, "per_epic").await.unwrap(),
        DocumentLifecycle::Partial
    );

    let err = harness
        .service
        .run_item(id, &root, "per_epic", "E9", None)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::ItemNotFound { .. }));

    // a full pass finishes the rest and completes the block
    assert!(harness.service.resume(id, None).await.unwrap().is_completed());
    assert_eq!(calls_for(&model, "epic_detail"), 2);
}

#[tokio::test]
async fn concurrent_resumes_execute_each_step_once() {
    let model = fixture_model();
    let harness = Harness::new(model.clone(), true);
    let root = ScopePath::root();
    let (id, _) = harness.service.start("proj-1", None).await.unwrap();
    harness
        .service
        .accept(id, &root, "epic_backlog", "product_owner")
        .await
        .unwrap();

    let (a, b) = tokio::join!(harness.service.resume(id, None), harness.service.resume(id, None));
    assert!(a.unwrap().is_completed());
    assert!(b.unwrap().is_completed());
    assert_eq!(calls_for(&model, "epic_detail"), 2);
}

#[tokio::test]
async fn lock_entries_are_released_after_each_operation() {
    let harness = Harness::new(fixture_model(), true);
    let root = ScopePath::root();
    let (id, _) = harness.service.start("proj-1", None).await.unwrap();
    assert_eq!(harness.service.held_locks(), 0);

    let accept = harness.service.accept(id, &root, "epic_backlog", "product_owner");
    let resume = async {
        tokio::task::yield_now().await;
        harness.service.resume(id, None).await
    };
    let (accepted, resumed) = tokio::join!(accept, resume);
    accepted.unwrap();
    resumed.unwrap();
    assert_eq!(harness.service.held_locks(), 0);

    harness.service.archive(id).await.unwrap();
    assert_eq!(harness.service.held_locks(), 0);
    let snapshot = harness.service.instance(id).await.unwrap();
    assert_eq!(snapshot.lifecycle, InstanceLifecycle::Archived);
}

#[tokio::test]
async fn archived_instances_are_read_only() {
    let harness = Harness::new(fixture_model(), true);
    let (id, _) = harness.service.start("proj-1", None).await.unwrap();
    harness.service.archive(id).await.unwrap();

    let err = harness.service.resume(id, None).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Archived { .. }));
    let err = harness
        .service
        .accept(id, &ScopePath::root(), "epic_backlog", "product_owner")
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Archived { .. }));
    assert_eq!(
        harness.service.instance(id).await.unwrap().lifecycle,
        InstanceLifecycle::Archived
    );
}

#[tokio::test]
async fn unknown_instances_are_reported() {
    let harness = Harness::new(fixture_model(), false);
    let err = harness
        .service
        .resume(docflow_workflow::InstanceId::new(), None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

fn file_backed_service(dir: &std::path::Path, model: Arc<FnModelClient>) -> WorkflowService {
    let steps = StepExecutor::new(
        model,
        Arc::new(MemoryAuditStore::new()),
        Arc::new(fixture_prompts()),
        EngineConfig::default(),
    );
    WorkflowService::new(
        WorkflowExecutor::new(backlog_workflow(true), steps),
        Arc::new(JsonFileInstanceStore::new(dir)),
    )
}

#[tokio::test]
async fn paused_instances_resume_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let model = fixture_model();
    let root = ScopePath::root();

    let id = {
        let service = file_backed_service(dir.path(), model.clone());
        let (id, result) = service.start("proj-1", None).await.unwrap();
        assert!(matches!(result, WorkflowResult::Paused(_)));
        id
    };

    let service = file_backed_service(dir.path(), model.clone());
    assert_eq!(service.list().await.unwrap(), vec![id]);
    service.accept(id, &root, "epic_backlog", "product_owner").await.unwrap();
    assert!(service.resume(id, None).await.unwrap().is_completed());

    assert_eq!(calls_for(&model, "discovery"), 1);
    assert_eq!(calls_for(&model, "epic_backlog"), 1);
    assert_eq!(model.call_count(), 4);
    let instance = service.instance(id).await.unwrap();
    assert_eq!(instance.lifecycle, InstanceLifecycle::Completed);
    assert!(instance.revision > 1);
}
