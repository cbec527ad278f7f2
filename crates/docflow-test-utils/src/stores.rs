use async_trait::async_trait;
use docflow_audit::{
    AuditError, AuditStore, AuditTx, CommitReceipt, InputRef, LlmRun, MemoryAuditStore, OutputRef, RunError, RunId,
    RunQuery,
};
use docflow_content::ContentStore;
use docflow_workflow::{DocumentStore, PortError, PromptStore, PromptTemplate, ScopePath};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Prompt store backed by maps; every prompt is version `1`
#[derive(Debug, Clone, Default)]
pub struct MemoryPromptStore {
    roles: HashMap<String, PromptTemplate>,
    tasks: HashMap<String, PromptTemplate>,
}

impl MemoryPromptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(mut self, role: &str, text: &str) -> Self {
        self.roles.insert(role.to_string(), PromptTemplate::new(role, "1", text));
        self
    }

    pub fn with_task(mut self, task: &str, text: &str) -> Self {
        self.tasks.insert(task.to_string(), PromptTemplate::new(task, "1", text));
        self
    }
}

#[async_trait]
impl PromptStore for MemoryPromptStore {
    async fn get_role(&self, role: &str) -> Result<PromptTemplate, PortError> {
        self.roles.get(role).cloned().ok_or_else(|| PortError::NotFound {
            kind: "role prompt",
            id: role.to_string(),
        })
    }

    async fn get_task(&self, task: &str) -> Result<PromptTemplate, PortError> {
        self.tasks.get(task).cloned().ok_or_else(|| PortError::NotFound {
            kind: "task prompt",
            id: task.to_string(),
        })
    }
}

/// Document store backed by a map keyed on `(doc_type, scope)`
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<HashMap<(String, String), String>>,
    puts: Mutex<Vec<(String, String)>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(self, doc_type: &str, scope: &ScopePath, content: &str) -> Self {
        self.documents
            .lock()
            .insert((doc_type.to_string(), scope.to_string()), content.to_string());
        self
    }

    pub fn document(&self, doc_type: &str, scope: &ScopePath) -> Option<String> {
        self.documents
            .lock()
            .get(&(doc_type.to_string(), scope.to_string()))
            .cloned()
    }

    /// `(doc_type, scope)` of every put, in order
    pub fn puts(&self) -> Vec<(String, String)> {
        self.puts.lock().clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, doc_type: &str, scope: &ScopePath) -> Result<Option<String>, PortError> {
        Ok(self.document(doc_type, scope))
    }

    async fn put(&self, doc_type: &str, scope: &ScopePath, content: &str) -> Result<(), PortError> {
        let key = (doc_type.to_string(), scope.to_string());
        self.puts.lock().push(key.clone());
        self.documents.lock().insert(key, content.to_string());
        Ok(())
    }
}

/// Audit store whose commits always fail; reads go to an empty store
#[derive(Debug, Default)]
pub struct FailingAuditStore {
    inner: MemoryAuditStore,
    attempts: Mutex<usize>,
}

impl FailingAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commits attempted so far
    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }
}

#[async_trait]
impl AuditStore for FailingAuditStore {
    async fn commit(&self, _tx: AuditTx) -> Result<CommitReceipt, AuditError> {
        *self.attempts.lock() += 1;
        Err(AuditError::Io(std::io::Error::other("audit backend unavailable")))
    }

    async fn get_run(&self, run_id: RunId) -> Result<LlmRun, AuditError> {
        self.inner.get_run(run_id).await
    }

    async fn list_runs(&self, query: &RunQuery) -> Result<Vec<LlmRun>, AuditError> {
        self.inner.list_runs(query).await
    }

    async fn input_refs(&self, run_id: RunId) -> Result<Vec<InputRef>, AuditError> {
        self.inner.input_refs(run_id).await
    }

    async fn output_refs(&self, run_id: RunId) -> Result<Vec<OutputRef>, AuditError> {
        self.inner.output_refs(run_id).await
    }

    async fn run_errors(&self, run_id: RunId) -> Result<Vec<RunError>, AuditError> {
        self.inner.run_errors(run_id).await
    }

    fn content(&self) -> Arc<dyn ContentStore> {
        self.inner.content()
    }
}
