//! Load-time validation
//!
//! [`ValidatedWorkflow`] can only be produced by [`validate`]; the executors
//! accept nothing else, so an unchecked definition never runs.

use super::{DocumentTypeDef, EntityTypeDef, InputSpec, ProduceStep, StepDef, WorkflowDefinition, WorkflowRef};
use crate::error::DefinitionError;
use crate::scope::ROOT_SCOPE;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Parent relation between scope names, derived from entity types
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeTree {
    parents: BTreeMap<String, String>,
}

impl ScopeTree {
    /// Parent of `scope`; `None` for the root or an unknown scope
    #[must_use]
    pub fn parent(&self, scope: &str) -> Option<&str> {
        self.parents.get(scope).map(String::as_str)
    }

    /// Whether `scope` is declared
    #[must_use]
    pub fn contains(&self, scope: &str) -> bool {
        scope == ROOT_SCOPE || self.parents.contains_key(scope)
    }

    /// `ancestor` is `scope` itself or one of its ancestors
    #[must_use]
    pub fn reaches(&self, scope: &str, ancestor: &str) -> bool {
        let mut current = Some(scope);
        while let Some(s) = current {
            if s == ancestor {
                return true;
            }
            current = self.parent(s);
        }
        false
    }

    /// Levels below the root
    #[must_use]
    pub fn depth(&self, scope: &str) -> usize {
        let mut depth = 0;
        let mut current = self.parent(scope);
        while let Some(s) = current {
            depth += 1;
            current = self.parent(s);
        }
        depth
    }
}

/// Summary returned with a successful validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    /// Validated definition
    pub workflow: WorkflowRef,
    /// Document types declared
    pub document_types: usize,
    /// Entity types declared
    pub entity_types: usize,
    /// Produce steps, nested ones included
    pub produce_steps: usize,
    /// Iteration blocks
    pub iteration_blocks: usize,
    /// Deepest scope level
    pub max_scope_depth: usize,
}

/// Where a step sits in the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepLocation {
    /// Scope name the step runs in
    pub scope: String,
    /// Enclosing iteration block, if any
    pub block: Option<String>,
}

/// A definition that passed every load-time check
#[derive(Debug, Clone)]
pub struct ValidatedWorkflow {
    definition: WorkflowDefinition,
    scopes: ScopeTree,
    locations: HashMap<String, StepLocation>,
    producers: HashMap<String, String>,
    report: ValidationReport,
}

impl ValidatedWorkflow {
    /// Definition as loaded
    #[must_use]
    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// Identity of the definition
    #[must_use]
    pub fn workflow_ref(&self) -> WorkflowRef {
        self.definition.workflow_ref()
    }

    /// Top-level step list
    #[must_use]
    pub fn steps(&self) -> &[StepDef] {
        &self.definition.steps
    }

    /// Declared scope tree
    #[must_use]
    pub fn scopes(&self) -> &ScopeTree {
        &self.scopes
    }

    /// Validation summary
    #[must_use]
    pub fn report(&self) -> &ValidationReport {
        &self.report
    }

    /// Declaration of document type `name`
    #[must_use]
    pub fn document_type(&self, name: &str) -> Option<&DocumentTypeDef> {
        self.definition.document_types.get(name)
    }

    /// Declaration of entity type `name`
    #[must_use]
    pub fn entity_type(&self, name: &str) -> Option<&EntityTypeDef> {
        self.definition.entity_types.get(name)
    }

    /// Step or block with ID `id`, at any depth
    #[must_use]
    pub fn step(&self, id: &str) -> Option<&StepDef> {
        self.definition.find_step(id)
    }

    /// Where `step_id` sits in the tree
    #[must_use]
    pub fn location(&self, step_id: &str) -> Option<&StepLocation> {
        self.locations.get(step_id)
    }

    /// The step producing `doc_type`
    #[must_use]
    pub fn producer_of(&self, doc_type: &str) -> Option<&ProduceStep> {
        let id = self.producers.get(doc_type)?;
        match self.definition.find_step(id) {
            Some(StepDef::Produce(step)) => Some(step),
            _ => None,
        }
    }
}

/// Validate a definition
///
/// # Errors
/// The first violated rule, as a [`DefinitionError`].
pub fn validate(definition: WorkflowDefinition) -> Result<ValidatedWorkflow, DefinitionError> {
    let scopes = build_scope_tree(&definition)?;
    check_document_types(&definition, &scopes)?;
    check_ownership(&definition)?;

    let mut walk = StepWalk {
        definition: &definition,
        scopes: &scopes,
        seen: HashSet::new(),
        locations: HashMap::new(),
        producers: HashMap::new(),
        blocks: 0,
    };
    walk.steps(&definition.steps, ROOT_SCOPE, None)?;

    let StepWalk {
        locations,
        producers,
        blocks,
        ..
    } = walk;

    let report = ValidationReport {
        workflow: definition.workflow_ref(),
        document_types: definition.document_types.len(),
        entity_types: definition.entity_types.len(),
        produce_steps: producers.len(),
        iteration_blocks: blocks,
        max_scope_depth: definition
            .entity_types
            .values()
            .map(|e| scopes.depth(&e.creates_scope))
            .max()
            .unwrap_or(0),
    };

    tracing::debug!(
        workflow = %report.workflow,
        steps = report.produce_steps,
        blocks = report.iteration_blocks,
        "workflow definition validated"
    );

    Ok(ValidatedWorkflow {
        definition,
        scopes,
        locations,
        producers,
        report,
    })
}

fn build_scope_tree(definition: &WorkflowDefinition) -> Result<ScopeTree, DefinitionError> {
    let mut parents = BTreeMap::new();
    for (name, entity) in &definition.entity_types {
        if entity.creates_scope == ROOT_SCOPE {
            return Err(DefinitionError::RootScopeRedefined {
                entity_type: name.clone(),
            });
        }
        let parent_doc = definition
            .document_types
            .get(&entity.parent_doc_type)
            .ok_or_else(|| DefinitionError::UnknownDocumentType {
                context: format!("entity type {name}"),
                doc_type: entity.parent_doc_type.clone(),
            })?;
        if parents
            .insert(entity.creates_scope.clone(), parent_doc.scope.clone())
            .is_some()
        {
            return Err(DefinitionError::DuplicateScope {
                scope: entity.creates_scope.clone(),
            });
        }
    }
    Ok(ScopeTree { parents })
}

fn check_document_types(definition: &WorkflowDefinition, scopes: &ScopeTree) -> Result<(), DefinitionError> {
    for (name, doc) in &definition.document_types {
        if !scopes.contains(&doc.scope) {
            return Err(DefinitionError::UnknownScope {
                context: format!("document type {name}"),
                scope: doc.scope.clone(),
            });
        }
        if doc.acceptance_required && doc.accepted_by.is_empty() {
            return Err(DefinitionError::MissingAcceptors {
                doc_type: name.clone(),
            });
        }
        for owned in &doc.may_own {
            let entity = definition
                .entity_types
                .get(owned)
                .ok_or_else(|| DefinitionError::UnknownEntityType {
                    context: format!("document type {name}"),
                    entity_type: owned.clone(),
                })?;
            if &entity.parent_doc_type != name {
                return Err(DefinitionError::InvalidOwnership {
                    doc_type: name.clone(),
                    entity_type: owned.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Ownership must be acyclic: document owns entity, entity scopes documents
fn check_ownership(definition: &WorkflowDefinition) -> Result<(), DefinitionError> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for name in definition.document_types.keys() {
        graph.add_node(name.as_str());
    }
    for (entity_name, entity) in &definition.entity_types {
        graph.add_edge(entity.parent_doc_type.as_str(), entity_name.as_str(), ());
        for (doc_name, doc) in &definition.document_types {
            if doc.scope == entity.creates_scope {
                graph.add_edge(entity_name.as_str(), doc_name.as_str(), ());
            }
        }
    }
    for (doc_name, doc) in &definition.document_types {
        for owned in &doc.may_own {
            graph.add_edge(doc_name.as_str(), owned.as_str(), ());
        }
    }

    toposort(&graph, None).map(|_| ()).map_err(|cycle| DefinitionError::OwnershipCycle {
        node: cycle.node_id().to_string(),
    })
}

struct StepWalk<'a> {
    definition: &'a WorkflowDefinition,
    scopes: &'a ScopeTree,
    seen: HashSet<String>,
    locations: HashMap<String, StepLocation>,
    producers: HashMap<String, String>,
    blocks: usize,
}

impl StepWalk<'_> {
    fn steps(&mut self, steps: &[StepDef], scope: &str, block: Option<&str>) -> Result<(), DefinitionError> {
        for step in steps {
            if !self.seen.insert(step.id().to_string()) {
                return Err(DefinitionError::DuplicateStepId {
                    step_id: step.id().to_string(),
                });
            }
            self.locations.insert(
                step.id().to_string(),
                StepLocation {
                    scope: scope.to_string(),
                    block: block.map(str::to_string),
                },
            );
            match step {
                StepDef::Produce(produce) => self.produce(produce, scope)?,
                StepDef::Iterate(iterate) => {
                    self.blocks += 1;
                    let block_err = |reason: String| DefinitionError::InvalidIterationBlock {
                        block_id: iterate.id.clone(),
                        reason,
                    };
                    let over = self
                        .definition
                        .document_types
                        .get(&iterate.over)
                        .ok_or_else(|| DefinitionError::UnknownDocumentType {
                            context: format!("iteration block {}", iterate.id),
                            doc_type: iterate.over.clone(),
                        })?;
                    if over.collection_field.is_none() {
                        return Err(block_err(format!(
                            "document type {} declares no collection_field",
                            iterate.over
                        )));
                    }
                    if over.scope != scope {
                        return Err(block_err(format!(
                            "collection document {} lives in scope {}, block runs in {scope}",
                            iterate.over, over.scope
                        )));
                    }
                    let entity = self
                        .definition
                        .entity_types
                        .get(&iterate.entity_type)
                        .ok_or_else(|| DefinitionError::UnknownEntityType {
                            context: format!("iteration block {}", iterate.id),
                            entity_type: iterate.entity_type.clone(),
                        })?;
                    if entity.parent_doc_type != iterate.over {
                        return Err(block_err(format!(
                            "entity type {} belongs to {}, not {}",
                            iterate.entity_type, entity.parent_doc_type, iterate.over
                        )));
                    }
                    if iterate.steps.is_empty() {
                        return Err(block_err("block has no steps".to_string()));
                    }
                    self.steps(&iterate.steps, &entity.creates_scope, Some(&iterate.id))?;
                }
            }
        }
        Ok(())
    }

    fn produce(&mut self, step: &ProduceStep, scope: &str) -> Result<(), DefinitionError> {
        let doc = self
            .definition
            .document_types
            .get(&step.produces)
            .ok_or_else(|| DefinitionError::UnknownDocumentType {
                context: format!("step {}", step.id),
                doc_type: step.produces.clone(),
            })?;
        if step.scope != doc.scope || step.scope != scope {
            return Err(DefinitionError::ScopeMismatch {
                step_id: step.id.clone(),
                step_scope: step.scope.clone(),
                doc_scope: doc.scope.clone(),
                enclosing_scope: scope.to_string(),
            });
        }
        if let Some(previous) = self.producers.insert(step.produces.clone(), step.id.clone()) {
            return Err(DefinitionError::DuplicateProducer {
                doc_type: step.produces.clone(),
                first: previous,
                second: step.id.clone(),
            });
        }
        for input in &step.inputs {
            match input {
                InputSpec::Document { doc_type, .. } => {
                    let source = self.definition.document_types.get(doc_type).ok_or_else(|| {
                        DefinitionError::UnknownDocumentType {
                            context: format!("input of step {}", step.id),
                            doc_type: doc_type.clone(),
                        }
                    })?;
                    if !self.scopes.reaches(scope, &source.scope) {
                        return Err(DefinitionError::UnreachableInput {
                            step_id: step.id.clone(),
                            doc_type: doc_type.clone(),
                            doc_scope: source.scope.clone(),
                            step_scope: scope.to_string(),
                        });
                    }
                    if doc_type == &step.produces {
                        return Err(DefinitionError::SelfInput {
                            step_id: step.id.clone(),
                        });
                    }
                }
                InputSpec::Item => {
                    if scope == ROOT_SCOPE {
                        return Err(DefinitionError::ItemOutsideIteration {
                            step_id: step.id.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{DocumentTypeDef, IterateStep};

    fn doc(scope: &str) -> DocumentTypeDef {
        DocumentTypeDef {
            scope: scope.into(),
            may_own: Vec::new(),
            collection_field: None,
            acceptance_required: false,
            accepted_by: Vec::new(),
        }
    }

    fn produce(id: &str, produces: &str, scope: &str, inputs: Vec<InputSpec>) -> StepDef {
        StepDef::Produce(ProduceStep {
            id: id.into(),
            role: "pm".into(),
            task: id.into(),
            produces: produces.into(),
            scope: scope.into(),
            inputs,
            handler: None,
            model: None,
        })
    }

    fn input(doc_type: &str) -> InputSpec {
        InputSpec::Document {
            doc_type: doc_type.into(),
            optional: false,
        }
    }

    /// discovery -> epic_backlog -> per epic: epic_detail -> per story: story_detail
    fn nested() -> WorkflowDefinition {
        let mut backlog = doc("project");
        backlog.may_own = vec!["epic".into()];
        backlog.collection_field = Some("epics".into());
        let mut epic_detail = doc("epic");
        epic_detail.may_own = vec!["story".into()];
        epic_detail.collection_field = Some("stories".into());

        WorkflowDefinition {
            workflow_id: "wf".into(),
            version: "1".into(),
            description: None,
            document_types: BTreeMap::from([
                ("discovery".to_string(), doc("project")),
                ("epic_backlog".to_string(), backlog),
                ("epic_detail".to_string(), epic_detail),
                ("story_detail".to_string(), doc("story")),
            ]),
            entity_types: BTreeMap::from([
                (
                    "epic".to_string(),
                    EntityTypeDef {
                        parent_doc_type: "epic_backlog".into(),
                        creates_scope: "epic".into(),
                    },
                ),
                (
                    "story".to_string(),
                    EntityTypeDef {
                        parent_doc_type: "epic_detail".into(),
                        creates_scope: "story".into(),
                    },
                ),
            ]),
            steps: vec![
                produce("discovery", "discovery", "project", vec![]),
                produce("epic_backlog", "epic_backlog", "project", vec![input("discovery")]),
                StepDef::Iterate(IterateStep {
                    id: "per_epic".into(),
                    over: "epic_backlog".into(),
                    entity_type: "epic".into(),
                    steps: vec![
                        produce("epic_detail", "epic_detail", "epic", vec![InputSpec::Item, input("discovery")]),
                        StepDef::Iterate(IterateStep {
                            id: "per_story".into(),
                            over: "epic_detail".into(),
                            entity_type: "story".into(),
                            steps: vec![produce(
                                "story_detail",
                                "story_detail",
                                "story",
                                vec![InputSpec::Item, input("epic_detail"), input("discovery")],
                            )],
                        }),
                    ],
                }),
            ],
        }
    }

    fn nested_block(def: &mut WorkflowDefinition) -> &mut Vec<StepDef> {
        let StepDef::Iterate(block) = &mut def.steps[2] else {
            unreachable!()
        };
        &mut block.steps
    }

    #[test]
    fn accepts_nested_workflow() {
        let validated = validate(nested()).unwrap();
        let report = validated.report();
        assert_eq!(report.produce_steps, 4);
        assert_eq!(report.iteration_blocks, 2);
        assert_eq!(report.max_scope_depth, 2);
        assert!(validated.scopes().reaches("story", "project"));
        assert_eq!(validated.location("story_detail").unwrap().scope, "story");
        assert_eq!(
            validated.location("epic_detail").unwrap().block.as_deref(),
            Some("per_epic")
        );
        assert_eq!(validated.producer_of("epic_detail").unwrap().id, "epic_detail");
    }

    #[test]
    fn rejects_descendant_input() {
        let mut def = nested();
        def.steps[1] = produce("epic_backlog", "epic_backlog", "project", vec![input("epic_detail")]);
        assert!(matches!(
            validate(def),
            Err(DefinitionError::UnreachableInput { .. })
        ));
    }

    #[test]
    fn rejects_sibling_scope_input() {
        let mut def = nested();
        def.document_types.insert("feature_doc".into(), doc("feature"));
        def.entity_types.insert(
            "feature".into(),
            EntityTypeDef {
                parent_doc_type: "discovery".into(),
                creates_scope: "feature".into(),
            },
        );
        nested_block(&mut def)[0] =
            produce("epic_detail", "epic_detail", "epic", vec![input("feature_doc")]);
        assert!(matches!(
            validate(def),
            Err(DefinitionError::UnreachableInput { .. })
        ));
    }

    #[test]
    fn rejects_step_scope_mismatch() {
        let mut def = nested();
        nested_block(&mut def)[0] = produce("epic_detail", "epic_detail", "project", vec![]);
        assert!(matches!(
            validate(def),
            Err(DefinitionError::ScopeMismatch { .. })
        ));
    }

    #[test]
    fn rejects_ownership_cycle() {
        let mut def = nested();
        // epic and story scopes become each other's parent
        def.document_types.get_mut("epic_backlog").unwrap().scope = "story".into();
        assert!(validate(def).is_err());

        let mut def = nested();
        def.entity_types.get_mut("epic").unwrap().parent_doc_type = "story_detail".into();
        def.document_types.get_mut("epic_backlog").unwrap().may_own.clear();
        def.document_types.get_mut("story_detail").unwrap().may_own = vec!["epic".into()];
        assert!(matches!(
            validate(def),
            Err(DefinitionError::OwnershipCycle { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_step_ids() {
        let mut def = nested();
        def.steps.push(produce("discovery", "discovery", "project", vec![]));
        assert!(matches!(
            validate(def),
            Err(DefinitionError::DuplicateStepId { .. })
        ));
    }

    #[test]
    fn rejects_acceptance_without_acceptors() {
        let mut def = nested();
        def.document_types.get_mut("discovery").unwrap().acceptance_required = true;
        assert!(matches!(
            validate(def),
            Err(DefinitionError::MissingAcceptors { .. })
        ));
    }

    #[test]
    fn rejects_block_over_document_without_collection() {
        let mut def = nested();
        def.document_types.get_mut("epic_backlog").unwrap().collection_field = None;
        assert!(matches!(
            validate(def),
            Err(DefinitionError::InvalidIterationBlock { .. })
        ));
    }

    #[test]
    fn rejects_item_input_at_root() {
        let mut def = nested();
        def.steps[0] = produce("discovery", "discovery", "project", vec![InputSpec::Item]);
        assert!(matches!(
            validate(def),
            Err(DefinitionError::ItemOutsideIteration { .. })
        ));
    }
}
