//! Workflow instances
//!
//! An instance owns every scope context of one workflow run, indexed by
//! [`ScopePath`]. Nothing is ever removed: documents keep their prior
//! versions, instances are only marked completed, failed or archived.

use crate::context::ContextState;
use crate::definition::WorkflowRef;
use crate::scope::ScopePath;
use crate::state::StepState;
use chrono::{DateTime, Utc};
use docflow_audit::{CorrelationId, RunId};
use docflow_content::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique instance identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    /// Random ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Instance lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceLifecycle {
    /// Steps may still run
    Active,
    /// Every step completed
    Completed,
    /// A step failed for good
    Failed,
    /// Closed to further operations
    Archived,
}

/// One item of a collection; it opened a child scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityItem {
    /// Item ID, unique within its collection
    pub id: String,
    /// Entity type of the item
    pub entity_type: String,
    /// Item payload from the declaring document
    pub data: serde_json::Value,
}

/// A replaced document version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentVersion {
    /// Version number
    pub version: u32,
    /// Document text
    pub content: String,
    /// Hash of `content`
    pub content_hash: ContentHash,
    /// Run that produced the version
    pub produced_by: Option<RunId>,
    /// When the version was accepted
    pub accepted_at: Option<DateTime<Utc>>,
    /// When a newer version replaced it
    pub replaced_at: DateTime<Utc>,
}

/// Current version of a document in a scope context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Document type
    pub doc_type: String,
    /// Owning scope
    pub scope: ScopePath,
    /// Document text
    pub content: String,
    /// Hash of `content`
    pub content_hash: ContentHash,
    /// Version number, from 1
    pub version: u32,
    /// Run that produced this version
    pub produced_by: Option<RunId>,
    /// When this version was accepted
    pub accepted_at: Option<DateTime<Utc>>,
    /// Role that accepted it
    pub accepted_by: Option<String>,
    /// Input document keys and the hashes this version was generated from
    #[serde(default)]
    pub depends_on: BTreeMap<String, ContentHash>,
    /// An input changed since generation; content is kept as is
    #[serde(default)]
    pub stale: bool,
    /// Replaced versions, oldest first
    #[serde(default)]
    pub history: Vec<DocumentVersion>,
    /// Last write
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    /// Slot key, see [`document_key`]
    #[must_use]
    pub fn key(&self) -> String {
        document_key(&self.scope, &self.doc_type)
    }
}

/// Stable key of a document slot: `project/epic:E1#epic_detail`
#[must_use]
pub fn document_key(scope: &ScopePath, doc_type: &str) -> String {
    format!("{scope}#{doc_type}")
}

/// A document being written
#[derive(Debug, Clone)]
pub struct NewDocument {
    /// Document type
    pub doc_type: String,
    /// Document text
    pub content: String,
    /// Run that produced it
    pub produced_by: Option<RunId>,
    /// Input document keys and hashes read
    pub depends_on: BTreeMap<String, ContentHash>,
    /// Role that accepted it, if already accepted
    pub accepted_by: Option<String>,
}

/// One scope context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeContext {
    /// Scope path
    pub path: ScopePath,
    /// Iteration item that created this context; `None` at the root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<EntityItem>,
    /// Current documents, by type
    #[serde(default)]
    pub documents: BTreeMap<String, DocumentRecord>,
    /// Items declared by this context's documents, by entity type
    #[serde(default)]
    pub entities: BTreeMap<String, Vec<EntityItem>>,
    /// Context state of the scope
    #[serde(default)]
    pub context: ContextState,
    /// Step states, by step ID
    #[serde(default)]
    pub steps: BTreeMap<String, StepState>,
}

impl ScopeContext {
    fn new(path: ScopePath, item: Option<EntityItem>) -> Self {
        Self {
            path,
            item,
            documents: BTreeMap::new(),
            entities: BTreeMap::new(),
            context: ContextState::default(),
            steps: BTreeMap::new(),
        }
    }
}

/// One run of a workflow for one project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Instance ID
    pub instance_id: InstanceId,
    /// Project the instance runs for
    pub project_id: String,
    /// Workflow and version that created it
    pub workflow: WorkflowRef,
    /// Correlation ID shared by the instance's model runs
    pub correlation_id: CorrelationId,
    /// Lifecycle
    pub lifecycle: InstanceLifecycle,
    /// Bumped on every persisted change
    pub revision: u64,
    /// Transition sequence counter
    #[serde(default)]
    seq: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last persisted change
    pub updated_at: DateTime<Utc>,
    scopes: BTreeMap<ScopePath, ScopeContext>,
}

impl WorkflowInstance {
    /// Active instance with an empty root scope
    #[must_use]
    pub fn new(project_id: impl Into<String>, workflow: WorkflowRef) -> Self {
        let instance_id = InstanceId::new();
        let now = Utc::now();
        let root = ScopePath::root();
        Self {
            instance_id,
            project_id: project_id.into(),
            workflow,
            correlation_id: CorrelationId(format!("wf-{instance_id}")),
            lifecycle: InstanceLifecycle::Active,
            revision: 0,
            seq: 0,
            created_at: now,
            updated_at: now,
            scopes: BTreeMap::from([(root.clone(), ScopeContext::new(root, None))]),
        }
    }

    /// Context at `path`
    #[must_use]
    pub fn scope(&self, path: &ScopePath) -> Option<&ScopeContext> {
        self.scopes.get(path)
    }

    /// Mutable context at `path`
    pub fn scope_mut(&mut self, path: &ScopePath) -> Option<&mut ScopeContext> {
        self.scopes.get_mut(path)
    }

    /// Every scope context, parents before children
    pub fn scopes(&self) -> impl Iterator<Item = &ScopeContext> {
        self.scopes.values()
    }

    /// Get or create the context at `path`, creating missing parents
    pub fn ensure_scope(&mut self, path: &ScopePath, item: Option<EntityItem>) -> &mut ScopeContext {
        if let Some(parent) = path.parent() {
            if !self.scopes.contains_key(&parent) {
                self.ensure_scope(&parent, None);
            }
        }
        let ctx = self
            .scopes
            .entry(path.clone())
            .or_insert_with(|| ScopeContext::new(path.clone(), None));
        if let Some(item) = item {
            ctx.item = Some(item);
        }
        ctx
    }

    /// Direct children of `path`
    #[must_use]
    pub fn children(&self, path: &ScopePath) -> Vec<&ScopeContext> {
        self.scopes
            .values()
            .filter(|ctx| ctx.path.parent().as_ref() == Some(path))
            .collect()
    }

    /// Step state at `scope`, if touched
    #[must_use]
    pub fn step(&self, scope: &ScopePath, step_id: &str) -> Option<&StepState> {
        self.scopes.get(scope)?.steps.get(step_id)
    }

    /// Step state at `scope`, created `pending` on first touch
    pub fn step_entry(&mut self, scope: &ScopePath, step_id: &str) -> &mut StepState {
        self.ensure_scope(scope, None)
            .steps
            .entry(step_id.to_string())
            .or_insert_with(|| StepState::new(step_id, scope.clone()))
    }

    /// Every step state touched so far
    pub fn steps(&self) -> impl Iterator<Item = &StepState> {
        self.scopes.values().flat_map(|ctx| ctx.steps.values())
    }

    /// Next transition sequence number
    pub fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Current document of `doc_type` at `scope`
    #[must_use]
    pub fn document(&self, scope: &ScopePath, doc_type: &str) -> Option<&DocumentRecord> {
        self.scopes.get(scope)?.documents.get(doc_type)
    }

    /// Documents anywhere in the instance
    pub fn documents(&self) -> impl Iterator<Item = &DocumentRecord> {
        self.scopes.values().flat_map(|ctx| ctx.documents.values())
    }

    pub(crate) fn documents_mut(&mut self) -> impl Iterator<Item = &mut DocumentRecord> {
        self.scopes.values_mut().flat_map(|ctx| ctx.documents.values_mut())
    }

    /// Write a document version; the previous one moves into history
    pub fn write_document(&mut self, scope: &ScopePath, doc: NewDocument) -> &DocumentRecord {
        let now = Utc::now();
        let content_hash = ContentHash::of_text(&doc.content);
        let accepted_at = doc.accepted_by.as_ref().map(|_| now);
        let ctx = self.ensure_scope(scope, None);
        let record = match ctx.documents.remove(&doc.doc_type) {
            Some(mut previous) => {
                previous.history.push(DocumentVersion {
                    version: previous.version,
                    content: std::mem::take(&mut previous.content),
                    content_hash: previous.content_hash,
                    produced_by: previous.produced_by,
                    accepted_at: previous.accepted_at,
                    replaced_at: now,
                });
                DocumentRecord {
                    doc_type: doc.doc_type.clone(),
                    scope: scope.clone(),
                    content: doc.content,
                    content_hash,
                    version: previous.version + 1,
                    produced_by: doc.produced_by,
                    accepted_at,
                    accepted_by: doc.accepted_by,
                    depends_on: doc.depends_on,
                    stale: false,
                    history: previous.history,
                    updated_at: now,
                }
            }
            None => DocumentRecord {
                doc_type: doc.doc_type.clone(),
                scope: scope.clone(),
                content: doc.content,
                content_hash,
                version: 1,
                produced_by: doc.produced_by,
                accepted_at,
                accepted_by: doc.accepted_by,
                depends_on: doc.depends_on,
                stale: false,
                history: Vec::new(),
                updated_at: now,
            },
        };
        ctx.documents
            .entry(doc.doc_type)
            .or_insert(record)
    }

    /// Record the items a document declares, replacing the previous list
    pub fn set_entities(&mut self, scope: &ScopePath, entity_type: &str, items: Vec<EntityItem>) {
        self.ensure_scope(scope, None)
            .entities
            .insert(entity_type.to_string(), items);
    }

    /// Items of `entity_type` declared at `scope`
    #[must_use]
    pub fn entities(&self, scope: &ScopePath, entity_type: &str) -> &[EntityItem] {
        self.scopes
            .get(scope)
            .and_then(|ctx| ctx.entities.get(entity_type))
            .map_or(&[], Vec::as_slice)
    }

    /// Record a persisted change
    pub fn bump_revision(&mut self) -> u64 {
        self.revision += 1;
        self.updated_at = Utc::now();
        self.revision
    }

    /// Whether the instance is archived
    #[must_use]
    pub fn is_archived(&self) -> bool {
        self.lifecycle == InstanceLifecycle::Archived
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{StepStatus, TransitionCause};

    fn instance() -> WorkflowInstance {
        WorkflowInstance::new(
            "proj-1",
            WorkflowRef {
                workflow_id: "wf".into(),
                version: "1".into(),
            },
        )
    }

    fn doc(doc_type: &str, content: &str) -> NewDocument {
        NewDocument {
            doc_type: doc_type.into(),
            content: content.into(),
            produced_by: None,
            depends_on: BTreeMap::new(),
            accepted_by: None,
        }
    }

    #[test]
    fn rewriting_a_document_keeps_history() {
        let mut inst = instance();
        let root = ScopePath::root();
        inst.write_document(&root, doc("discovery", "v1"));
        let record = inst.write_document(&root, doc("discovery", "v2"));
        assert_eq!(record.version, 2);
        assert_eq!(record.content, "v2");
        assert_eq!(record.history.len(), 1);
        assert_eq!(record.history[0].content, "v1");
        assert_eq!(record.history[0].content_hash, ContentHash::of_text("v1"));
    }

    #[test]
    fn ensure_scope_creates_parents_and_keeps_item() {
        let mut inst = instance();
        let story = ScopePath::root().child("epic", "E1").child("story", "S1");
        inst.ensure_scope(
            &story,
            Some(EntityItem {
                id: "S1".into(),
                entity_type: "story".into(),
                data: serde_json::json!({"id": "S1"}),
            }),
        );
        assert!(inst.scope(&ScopePath::root().child("epic", "E1")).is_some());
        assert_eq!(inst.scope(&story).unwrap().item.as_ref().unwrap().id, "S1");
        assert_eq!(inst.children(&ScopePath::root()).len(), 1);

        inst.ensure_scope(&story, None);
        assert!(inst.scope(&story).unwrap().item.is_some());
    }

    #[test]
    fn json_round_trip_preserves_scope_keys() {
        let mut inst = instance();
        let epic = ScopePath::root().child("epic", "E1");
        let seq = inst.next_seq();
        inst.step_entry(&epic, "epic_detail")
            .transition(StepStatus::Executing, TransitionCause::Entered, seq)
            .unwrap();
        let json = serde_json::to_string(&inst).unwrap();
        assert!(json.contains("\"project/epic:E1\""));
        let back: WorkflowInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(back, inst);
        assert_eq!(back.next_seq_peek(), 1);
    }

    impl WorkflowInstance {
        fn next_seq_peek(&self) -> u64 {
            self.seq
        }
    }
}
