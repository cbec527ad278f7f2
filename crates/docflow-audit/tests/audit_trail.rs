//! Audit trail behaviour through the public API

use docflow_audit::{
    AuditService, AuditStore, AuditTx, ContentKind, ExecutionLogger, MemoryAuditStore, ModelClient, ModelRequest,
    NewRun, RunId, RunQuery, RunStatus, TokenUsage,
};
use docflow_content::ContentStore;
use docflow_test_utils::{fixture_reply, FnModelClient, Harness, ScriptedModelClient};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

const SYSTEM: &str = "You are the Product Manager.";
const USER: &str = "# Task\nWrite the discovery document.";

async fn log_run(store: &MemoryAuditStore, output: &str, usage: TokenUsage) -> RunId {
    let logger = ExecutionLogger::new();
    let mut tx = AuditTx::begin();
    let run_id = logger.start_run(
        &mut tx,
        NewRun::new("default", "pm", "discovery", "corr-1").with_parameters(serde_json::json!({"temperature": 0.2})),
    );
    logger.add_input(&mut tx, run_id, ContentKind::SystemPrompt, SYSTEM, 0);
    logger.add_input(&mut tx, run_id, ContentKind::UserPrompt, USER, 1);
    logger.add_output(&mut tx, run_id, ContentKind::RawText, output);
    logger.complete_run(&mut tx, run_id, usage, RunStatus::Success);
    store.commit(tx).await.unwrap();
    run_id
}

#[tokio::test]
async fn replay_with_identical_inputs_reports_zero_input_delta() {
    let store = Arc::new(MemoryAuditStore::new());
    let original = log_run(&store, "original output", TokenUsage::new(4012, 300)).await;

    let model = Arc::new(ScriptedModelClient::new());
    model.push_response("a different output", TokenUsage::new(4012, 280));
    let service = AuditService::with_model(store.clone(), model.clone(), Duration::from_secs(30));

    let outcome = service.replay(original).await.unwrap();
    let comparison = &outcome.comparison;
    assert_eq!(comparison.input_tokens_delta, Some(0));
    assert_eq!(comparison.output_tokens_delta, Some(-20));
    assert!(!comparison.output.same_hash);
    assert!(comparison.output.divergence_expected);

    let sent = &model.requests()[0];
    assert_eq!(sent.system_prompt, SYSTEM);
    assert_eq!(sent.user_prompt, USER);
    assert_eq!(sent.params, serde_json::json!({"temperature": 0.2}));

    let replay = store.get_run(outcome.new_run_id).await.unwrap();
    assert!(replay.is_replay);
    assert_eq!(replay.original_run_id, Some(original));
    assert_ne!(replay.correlation_id, store.get_run(original).await.unwrap().correlation_id);

    // the original run is untouched
    let detail = service.run_detail(original).await.unwrap();
    assert_eq!(detail.run.input_tokens, Some(4012));
    assert_eq!(detail.outputs.len(), 1);
}

#[tokio::test]
async fn identical_content_is_stored_once_and_referenced_per_run() {
    let store = MemoryAuditStore::new();
    let runs = 5;
    for _ in 0..runs {
        log_run(&store, "same output", TokenUsage::new(10, 5)).await;
    }

    assert_eq!(store.run_count(), runs);
    assert_eq!(store.ref_count(), runs * 3);
    assert_eq!(store.content().len().await.unwrap(), 3);
}

#[tokio::test]
async fn journal_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");

    let run_id = {
        let store = MemoryAuditStore::open(&path).unwrap();
        log_run(&store, "persisted output", TokenUsage::new(12, 7)).await
    };

    let reopened = Arc::new(MemoryAuditStore::open(&path).unwrap());
    let run = reopened.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.output_tokens, Some(7));

    let inputs = AuditService::new(reopened).reconstruct_inputs(run_id).await.unwrap();
    assert_eq!(inputs.get(ContentKind::SystemPrompt), Some(SYSTEM));
    assert_eq!(inputs.get(ContentKind::UserPrompt), Some(USER));
}

#[tokio::test]
async fn engine_runs_reconstruct_to_the_prompts_sent() {
    let model = Arc::new(FnModelClient::text(fixture_reply));
    let harness = Harness::new(model.clone() as Arc<dyn ModelClient>, false);
    let (_, result) = harness.service.start("proj-1", None).await.unwrap();
    assert!(result.is_completed());

    let service = AuditService::new(harness.audit.clone());
    let runs = service.list_runs(&RunQuery::new()).await.unwrap();
    let sent: Vec<ModelRequest> = model.requests();
    assert_eq!(runs.len(), sent.len());

    let mut logged = Vec::new();
    for run in &runs {
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.metadata.get("attempt").map(String::as_str), Some("1"));
        let inputs = service.reconstruct_inputs(run.id).await.unwrap();
        assert!(inputs.get(ContentKind::TaskPrompt).is_some());
        let system = inputs.get(ContentKind::SystemPrompt).unwrap_or_default().to_string();
        let user = inputs.get(ContentKind::UserPrompt).unwrap_or_default().to_string();
        logged.push((system, user));
    }
    let mut expected: Vec<_> = sent
        .iter()
        .map(|r| (r.system_prompt.clone(), r.user_prompt.clone()))
        .collect();
    logged.sort();
    expected.sort();
    assert_eq!(logged, expected);

    let epic_runs = service
        .list_runs(&RunQuery::new().artifact_type("epic_detail"))
        .await
        .unwrap();
    assert_eq!(epic_runs.len(), 2);
    let mut scopes: Vec<_> = epic_runs.iter().filter_map(|r| r.metadata.get("scope").cloned()).collect();
    scopes.sort();
    assert_eq!(scopes, vec!["project/epic:E1".to_string(), "project/epic:E2".to_string()]);
}
