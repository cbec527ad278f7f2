use crate::stores::{MemoryDocumentStore, MemoryPromptStore};
use docflow_audit::{MemoryAuditStore, ModelClient, ModelRequest};
use docflow_workflow::{
    validate, EngineConfig, HandlerRegistry, MemoryInstanceStore, StepExecutor, ValidatedWorkflow, WorkflowDefinition,
    WorkflowExecutor, WorkflowService,
};
use std::sync::Arc;

/// Collection the fixture model returns for `epic_backlog`
pub const EPIC_BACKLOG: &str = r#"{"epics":[{"id":"E1","title":"Onboarding"},{"id":"E2","title":"Billing"}]}"#;

/// discovery -> epic_backlog -> per epic: epic_detail
pub fn backlog_workflow_yaml(backlog_acceptance: bool) -> String {
    format!(
        r"
workflow_id: backlog
version: '1'
document_types:
  discovery:
    scope: project
  epic_backlog:
    scope: project
    may_own: [epic]
    collection_field: epics
    acceptance_required: {backlog_acceptance}
    accepted_by: [product_owner]
  epic_detail:
    scope: epic
entity_types:
  epic:
    parent_doc_type: epic_backlog
    creates_scope: epic
steps:
  - kind: produce
    id: discovery
    role: pm
    task: discovery
    produces: discovery
    scope: project
  - kind: produce
    id: epic_backlog
    role: pm
    task: epic_backlog
    produces: epic_backlog
    scope: project
    inputs:
      - from: document
        doc_type: discovery
  - kind: iterate
    id: per_epic
    over: epic_backlog
    entity_type: epic
    steps:
      - kind: produce
        id: epic_detail
        role: architect
        task: epic_detail
        produces: epic_detail
        scope: epic
        inputs:
          - from: item
          - from: document
            doc_type: discovery
"
    )
}

pub fn backlog_workflow(backlog_acceptance: bool) -> Arc<ValidatedWorkflow> {
    let definition = WorkflowDefinition::from_yaml(&backlog_workflow_yaml(backlog_acceptance)).expect("fixture workflow parses");
    Arc::new(validate(definition).expect("fixture workflow is valid"))
}

/// First line of every fixture task prompt
pub fn task_marker(task: &str) -> String {
    format!("TASK:{task}")
}

pub fn fixture_prompts() -> MemoryPromptStore {
    let mut prompts = MemoryPromptStore::new()
        .with_role("pm", "You are the Product Manager.")
        .with_role("architect", "You are the Architect.");
    for task in ["discovery", "epic_backlog", "epic_detail"] {
        prompts = prompts.with_task(task, &format!("{}\nWrite the {task} document.", task_marker(task)));
    }
    prompts
}

/// Deterministic reply to a fixture task prompt
pub fn fixture_reply(request: &ModelRequest) -> String {
    let prompt = &request.user_prompt;
    if prompt.contains(&task_marker("discovery")) {
        r#"{"problem":"Teams lose track of customer onboarding","users":["admins","new customers"]}"#.to_string()
    } else if prompt.contains(&task_marker("epic_backlog")) {
        EPIC_BACKLOG.to_string()
    } else if prompt.contains(&task_marker("epic_detail")) {
        let epic = prompt
            .lines()
            .find_map(|line| line.strip_prefix("# Current epic: "))
            .unwrap_or("unknown");
        format!(r#"{{"epic":"{epic}","stories":[]}}"#)
    } else {
        "unrecognised task".to_string()
    }
}

/// A service wired to in-memory stores
pub struct Harness {
    pub workflow: Arc<ValidatedWorkflow>,
    pub audit: Arc<MemoryAuditStore>,
    pub documents: Arc<MemoryDocumentStore>,
    pub instances: Arc<MemoryInstanceStore>,
    pub service: WorkflowService,
}

impl Harness {
    pub fn new(model: Arc<dyn ModelClient>, backlog_acceptance: bool) -> Self {
        Self::build(
            model,
            backlog_workflow(backlog_acceptance),
            HandlerRegistry::new(),
            EngineConfig::default(),
        )
    }

    pub fn build(
        model: Arc<dyn ModelClient>,
        workflow: Arc<ValidatedWorkflow>,
        handlers: HandlerRegistry,
        config: EngineConfig,
    ) -> Self {
        let audit = Arc::new(MemoryAuditStore::new());
        let documents = Arc::new(MemoryDocumentStore::new());
        let instances = Arc::new(MemoryInstanceStore::new());
        let steps = StepExecutor::new(model, audit.clone(), Arc::new(fixture_prompts()), config)
            .with_documents(documents.clone())
            .with_handlers(handlers);
        let service = WorkflowService::new(WorkflowExecutor::new(workflow.clone(), steps), instances.clone());
        Self {
            workflow,
            audit,
            documents,
            instances,
            service,
        }
    }
}
