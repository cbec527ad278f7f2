//! Workflow definitions
//!
//! A definition is declarative data: the document types a workflow produces,
//! the entity types that spawn child scopes, and the ordered step list. It is
//! loaded from JSON or YAML and must pass [`validate`] before anything can
//! execute it.

mod validate;

pub use validate::{validate, ScopeTree, StepLocation, ValidatedWorkflow, ValidationReport};

use crate::error::DefinitionError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Identity of a definition version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowRef {
    /// Workflow name
    pub workflow_id: String,
    /// Definition version
    pub version: String,
}

impl std::fmt::Display for WorkflowRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.workflow_id, self.version)
    }
}

/// Declarative workflow, as loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name
    pub workflow_id: String,
    /// Definition version
    pub version: String,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Governed document types, by name
    pub document_types: BTreeMap<String, DocumentTypeDef>,
    /// Entity types, by name
    #[serde(default)]
    pub entity_types: BTreeMap<String, EntityTypeDef>,
    /// Top-level step list
    pub steps: Vec<StepDef>,
}

/// A governed document type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentTypeDef {
    /// Scope the document lives in
    pub scope: String,
    /// Entity types whose items this document declares
    #[serde(default)]
    pub may_own: Vec<String>,
    /// JSON field holding the item collection, for documents that are iterated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_field: Option<String>,
    /// A role must accept before the document completes
    #[serde(default)]
    pub acceptance_required: bool,
    /// Roles allowed to accept
    #[serde(default)]
    pub accepted_by: Vec<String>,
}

/// An entity type; each item opens a child scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTypeDef {
    /// Document type declaring the items
    pub parent_doc_type: String,
    /// Scope each item opens
    pub creates_scope: String,
}

/// One entry of a step list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepDef {
    /// Produce one document with one role/task
    Produce(ProduceStep),
    /// Run nested steps once per item of a collection
    Iterate(IterateStep),
}

impl StepDef {
    /// Step or block ID
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Produce(step) => &step.id,
            Self::Iterate(block) => &block.id,
        }
    }
}

/// A document-producing step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProduceStep {
    /// Step ID, unique in the workflow
    pub id: String,
    /// Role prompt name
    pub role: String,
    /// Task prompt name
    pub task: String,
    /// Document type this step produces
    pub produces: String,
    /// Scope the step runs at
    pub scope: String,
    /// Inputs, in request order
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    /// Task handler name; defaults to the task name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    /// Model override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Where a step input comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum InputSpec {
    /// A document in the step's scope or an ancestor scope
    Document {
        doc_type: String,
        #[serde(default)]
        optional: bool,
    },
    /// The iteration item that created the step's scope
    Item,
}

/// An iteration block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterateStep {
    /// Block ID
    pub id: String,
    /// Document holding the collection
    pub over: String,
    /// Entity type iterated
    pub entity_type: String,
    /// Steps run for every item
    pub steps: Vec<StepDef>,
}

impl WorkflowDefinition {
    /// Identity of this definition
    #[must_use]
    pub fn workflow_ref(&self) -> WorkflowRef {
        WorkflowRef {
            workflow_id: self.workflow_id.clone(),
            version: self.version.clone(),
        }
    }

    /// Parse from JSON
    ///
    /// # Errors
    /// `DefinitionError::Parse` on malformed input.
    pub fn from_json(text: &str) -> Result<Self, DefinitionError> {
        serde_json::from_str(text).map_err(|e| DefinitionError::Parse(e.to_string()))
    }

    /// Parse from YAML
    ///
    /// # Errors
    /// `DefinitionError::Parse` on malformed input.
    pub fn from_yaml(text: &str) -> Result<Self, DefinitionError> {
        serde_yaml::from_str(text).map_err(|e| DefinitionError::Parse(e.to_string()))
    }

    /// Load from a `.json`, `.yaml` or `.yml` file
    ///
    /// # Errors
    /// I/O failures, unknown extensions and parse errors.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DefinitionError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| DefinitionError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text),
            Some("yaml" | "yml") => Self::from_yaml(&text),
            other => Err(DefinitionError::Parse(format!(
                "unsupported definition format: {}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    /// Every produce step, depth first
    #[must_use]
    pub fn produce_steps(&self) -> Vec<&ProduceStep> {
        fn walk<'a>(steps: &'a [StepDef], out: &mut Vec<&'a ProduceStep>) {
            for step in steps {
                match step {
                    StepDef::Produce(p) => out.push(p),
                    StepDef::Iterate(block) => walk(&block.steps, out),
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.steps, &mut out);
        out
    }

    /// Find a step anywhere in the tree
    #[must_use]
    pub fn find_step(&self, id: &str) -> Option<&StepDef> {
        fn walk<'a>(steps: &'a [StepDef], id: &str) -> Option<&'a StepDef> {
            for step in steps {
                if step.id() == id {
                    return Some(step);
                }
                if let StepDef::Iterate(block) = step {
                    if let Some(found) = walk(&block.steps, id) {
                        return Some(found);
                    }
                }
            }
            None
        }
        walk(&self.steps, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r"
workflow_id: software_product
version: '1'
document_types:
  discovery:
    scope: project
    acceptance_required: true
    accepted_by: [product_owner]
  epic_backlog:
    scope: project
    may_own: [epic]
    collection_field: epics
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
  - kind: iterate
    id: per_epic
    over: epic_backlog
    entity_type: epic
    steps:
      - kind: produce
        id: epic_detail
        role: ba
        task: epic_detail
        produces: epic_detail
        scope: epic
        inputs:
          - from: item
          - from: document
            doc_type: discovery
";

    #[test]
    fn loads_tagged_steps_from_yaml() {
        let def = WorkflowDefinition::from_yaml(YAML).unwrap();
        assert_eq!(def.workflow_ref().to_string(), "software_product@1");
        assert!(matches!(def.steps[1], StepDef::Iterate(_)));
        let detail = def.produce_steps()[1];
        assert_eq!(detail.inputs[0], InputSpec::Item);
        assert_eq!(
            detail.inputs[1],
            InputSpec::Document {
                doc_type: "discovery".into(),
                optional: false
            }
        );
        assert_eq!(def.find_step("epic_detail").map(StepDef::id), Some("epic_detail"));
    }

    #[test]
    fn json_and_yaml_agree() {
        let def = WorkflowDefinition::from_yaml(YAML).unwrap();
        let json = serde_json::to_string(&def).unwrap();
        assert_eq!(WorkflowDefinition::from_json(&json).unwrap(), def);
    }

    #[test]
    fn unknown_step_kind_is_a_parse_error() {
        let bad = YAML.replace("kind: iterate", "kind: loop");
        assert!(matches!(
            WorkflowDefinition::from_yaml(&bad),
            Err(DefinitionError::Parse(_))
        ));
    }
}
