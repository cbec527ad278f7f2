//! Context state
//!
//! Structured memory of a workflow, one [`ContextState`] per scope context.
//! It changes only through named [`ContextDelta`] merges checked against a
//! [`ContextSchema`], and reaches the model only through
//! [`ContextStateManager::render_for_prompt`].

use crate::error::ContextError;
use crate::instance::WorkflowInstance;
use crate::request::RenderedContext;
use crate::scope::ScopePath;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// How a delta combines with the current value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Last write wins
    #[default]
    Replace,
    /// List values accumulate; exact duplicates are dropped
    Append,
    /// Object values merge key by key, last write wins per key
    MergeKeys,
}

/// Expected JSON shape of a field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldShape {
    /// JSON string
    Text,
    /// JSON boolean
    Bool,
    /// JSON number
    Number,
    /// JSON array
    List,
    /// JSON object
    Object,
    /// Any value
    #[default]
    Any,
}

impl FieldShape {
    fn name(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Bool => "bool",
            Self::Number => "number",
            Self::List => "list",
            Self::Object => "object",
            Self::Any => "any",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Text => value.is_string(),
            Self::Bool => value.is_boolean(),
            Self::Number => value.is_number(),
            Self::List => value.is_array(),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "text",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Declaration of one context field
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Expected value shape
    #[serde(default)]
    pub shape: FieldShape,
    /// How a new value combines with the current one
    #[serde(default)]
    pub merge: MergePolicy,
    /// Roles that see the field when rendered; empty means every role
    #[serde(default)]
    pub visible_to: Vec<String>,
}

impl FieldSpec {
    /// Field visible to every role
    #[must_use]
    pub fn new(shape: FieldShape, merge: MergePolicy) -> Self {
        Self {
            shape,
            merge,
            visible_to: Vec::new(),
        }
    }

    /// Restrict rendering to `roles`
    #[must_use]
    pub fn visible_to(mut self, roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.visible_to = roles.into_iter().map(Into::into).collect();
        self
    }

    fn visible(&self, role: &str) -> bool {
        self.visible_to.is_empty() || self.visible_to.iter().any(|r| r == role)
    }
}

/// Field declarations for context state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSchema {
    /// Declared fields, by name
    pub fields: BTreeMap<String, FieldSpec>,
}

impl ContextSchema {
    /// Schema with no fields
    #[must_use]
    pub fn empty() -> Self {
        Self {
            fields: BTreeMap::new(),
        }
    }

    /// Add a field declaration
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }

    /// Declaration of `name`
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }
}

impl Default for ContextSchema {
    /// Known facts, open gaps, prior answers and readiness flags
    fn default() -> Self {
        Self::empty()
            .with_field("known_facts", FieldSpec::new(FieldShape::List, MergePolicy::Append))
            .with_field("open_gaps", FieldSpec::new(FieldShape::List, MergePolicy::Append))
            .with_field("prior_answers", FieldSpec::new(FieldShape::Object, MergePolicy::MergeKeys))
            .with_field("readiness", FieldSpec::new(FieldShape::Object, MergePolicy::MergeKeys))
    }
}

/// A named change to context state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextDelta {
    /// What produced the delta, e.g. `clarification_answers`
    pub name: String,
    /// Values to apply, by field
    pub fields: BTreeMap<String, Value>,
}

impl ContextDelta {
    /// Empty delta
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Set one field
    #[must_use]
    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    /// Whether the delta sets nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Schema-checked structured memory of one scope context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextState {
    fields: BTreeMap<String, Value>,
    /// Names of applied deltas, in order
    #[serde(default)]
    applied: Vec<String>,
}

impl ContextState {
    /// Value of `field`
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Every set field
    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Names of applied deltas, in order
    #[must_use]
    pub fn applied(&self) -> &[String] {
        &self.applied
    }

    /// Whether no field is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Applies deltas and renders state, under one schema
#[derive(Debug, Clone, Default)]
pub struct ContextStateManager {
    schema: ContextSchema,
}

impl ContextStateManager {
    /// Create manager
    #[must_use]
    pub fn new(schema: ContextSchema) -> Self {
        Self { schema }
    }

    /// Schema deltas are checked against
    #[must_use]
    pub fn schema(&self) -> &ContextSchema {
        &self.schema
    }

    /// Reject unknown fields and shape mismatches
    ///
    /// # Errors
    /// `UnknownField` or `ShapeMismatch` for the first offending field.
    pub fn check(&self, delta: &ContextDelta) -> Result<(), ContextError> {
        for (field, value) in &delta.fields {
            let spec = self
                .schema
                .field(field)
                .ok_or_else(|| ContextError::UnknownField {
                    field: field.clone(),
                })?;
            if !spec.shape.accepts(value) {
                return Err(ContextError::ShapeMismatch {
                    field: field.clone(),
                    expected: spec.shape.name(),
                    found: value_kind(value),
                });
            }
        }
        Ok(())
    }

    /// Apply `delta` to `state`; on error `state` is unchanged
    ///
    /// # Errors
    /// See [`check`](Self::check).
    pub fn apply(&self, state: &mut ContextState, delta: &ContextDelta) -> Result<(), ContextError> {
        self.check(delta)?;
        for (field, value) in &delta.fields {
            let policy = self.schema.field(field).map_or(MergePolicy::Replace, |s| s.merge);
            let slot = state.fields.entry(field.clone()).or_insert(Value::Null);
            merge_value(slot, value, policy);
        }
        state.applied.push(delta.name.clone());
        Ok(())
    }

    /// Merge `delta` into the context at `scope` and return the new state
    ///
    /// # Errors
    /// `ScopeNotFound` when the instance has no context at `scope`, or a
    /// schema violation.
    pub fn merge(
        &self,
        instance: &mut WorkflowInstance,
        scope: &ScopePath,
        delta: &ContextDelta,
    ) -> Result<ContextState, ContextError> {
        let ctx = instance
            .scope_mut(scope)
            .ok_or_else(|| ContextError::ScopeNotFound {
                scope: scope.clone(),
            })?;
        self.apply(&mut ctx.context, delta)?;
        tracing::debug!(scope = %scope, delta = %delta.name, "context delta merged");
        Ok(ctx.context.clone())
    }

    /// State visible at `scope`: root first, each descendant merged on top
    ///
    /// # Errors
    /// `ScopeNotFound` when any context on the path is missing.
    pub fn effective(&self, instance: &WorkflowInstance, scope: &ScopePath) -> Result<ContextState, ContextError> {
        let mut lineage = scope.lineage();
        lineage.reverse();
        let mut out = ContextState::default();
        for path in lineage {
            let ctx = instance
                .scope(&path)
                .ok_or_else(|| ContextError::ScopeNotFound { scope: path.clone() })?;
            for (field, value) in &ctx.context.fields {
                let policy = self.schema.field(field).map_or(MergePolicy::Replace, |s| s.merge);
                let slot = out.fields.entry(field.clone()).or_insert(Value::Null);
                merge_value(slot, value, policy);
            }
            out.applied.extend(ctx.context.applied.iter().cloned());
        }
        Ok(out)
    }

    /// Deterministic text rendering of the fields `role` may see
    #[must_use]
    pub fn render_for_prompt(&self, state: &ContextState, role: &str, task: &str) -> RenderedContext {
        let mut out = String::new();
        let _ = writeln!(out, "# Context ({task})");
        for (field, value) in &state.fields {
            let visible = self.schema.field(field).map_or(true, |spec| spec.visible(role));
            if !visible || value.is_null() {
                continue;
            }
            let _ = writeln!(out, "\n## {field}");
            render_value(&mut out, value);
        }
        RenderedContext::new(out)
    }
}

fn merge_value(slot: &mut Value, incoming: &Value, policy: MergePolicy) {
    match policy {
        MergePolicy::Append if incoming.is_array() => {
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            if let (Value::Array(existing), Value::Array(items)) = (slot, incoming) {
                for item in items {
                    if !existing.contains(item) {
                        existing.push(item.clone());
                    }
                }
            }
        }
        MergePolicy::MergeKeys if incoming.is_object() => {
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let (Value::Object(existing), Value::Object(entries)) = (slot, incoming) {
                for (key, value) in entries {
                    existing.insert(key.clone(), value.clone());
                }
            }
        }
        _ => *slot = incoming.clone(),
    }
}

fn render_value(out: &mut String, value: &Value) {
    match value {
        Value::Array(items) => {
            for item in items {
                let _ = writeln!(out, "- {}", scalar(item));
            }
        }
        Value::Object(entries) => {
            let sorted: BTreeMap<&String, &Value> = entries.iter().collect();
            for (key, item) in sorted {
                let _ = writeln!(out, "- {key}: {}", scalar(item));
            }
        }
        other => {
            let _ = writeln!(out, "{}", scalar(other));
        }
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WorkflowRef;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn instance() -> WorkflowInstance {
        WorkflowInstance::new(
            "proj-1",
            WorkflowRef {
                workflow_id: "wf".into(),
                version: "1".into(),
            },
        )
    }

    #[test]
    fn append_and_merge_keys_accumulate() {
        let manager = ContextStateManager::default();
        let mut state = ContextState::default();
        manager
            .apply(
                &mut state,
                &ContextDelta::new("discovery")
                    .set("known_facts", json!(["B2B only"]))
                    .set("prior_answers", json!({"q1": "EU"})),
            )
            .unwrap();
        manager
            .apply(
                &mut state,
                &ContextDelta::new("clarification_answers")
                    .set("known_facts", json!(["B2B only", "SSO required"]))
                    .set("prior_answers", json!({"q2": "yes", "q1": "EU and UK"})),
            )
            .unwrap();

        assert_eq!(state.get("known_facts"), Some(&json!(["B2B only", "SSO required"])));
        assert_eq!(state.get("prior_answers"), Some(&json!({"q1": "EU and UK", "q2": "yes"})));
        assert_eq!(state.applied(), ["discovery", "clarification_answers"]);
    }

    #[test]
    fn replace_is_last_write_wins() {
        let schema = ContextSchema::empty()
            .with_field("phase", FieldSpec::new(FieldShape::Text, MergePolicy::Replace));
        let manager = ContextStateManager::new(schema);
        let mut state = ContextState::default();
        manager.apply(&mut state, &ContextDelta::new("a").set("phase", json!("draft"))).unwrap();
        manager.apply(&mut state, &ContextDelta::new("b").set("phase", json!("final"))).unwrap();
        assert_eq!(state.get("phase"), Some(&json!("final")));
    }

    #[test]
    fn rejects_unknown_field_and_bad_shape_atomically() {
        let manager = ContextStateManager::default();
        let mut state = ContextState::default();
        let err = manager
            .apply(&mut state, &ContextDelta::new("x").set("transcript", json!("...")))
            .unwrap_err();
        assert!(matches!(err, ContextError::UnknownField { .. }));

        let err = manager
            .apply(
                &mut state,
                &ContextDelta::new("x")
                    .set("known_facts", json!(["ok"]))
                    .set("open_gaps", json!("not a list")),
            )
            .unwrap_err();
        assert_eq!(
            err,
            ContextError::ShapeMismatch {
                field: "open_gaps".into(),
                expected: "list",
                found: "text"
            }
        );
        assert!(state.is_empty());
    }

    #[test]
    fn effective_state_layers_ancestors() {
        let manager = ContextStateManager::default();
        let mut inst = instance();
        let epic = ScopePath::root().child("epic", "E1");
        inst.ensure_scope(&epic, None);
        manager
            .merge(&mut inst, &ScopePath::root(), &ContextDelta::new("root").set("known_facts", json!(["a"])))
            .unwrap();
        manager
            .merge(&mut inst, &epic, &ContextDelta::new("epic").set("known_facts", json!(["b"])))
            .unwrap();

        let effective = manager.effective(&inst, &epic).unwrap();
        assert_eq!(effective.get("known_facts"), Some(&json!(["a", "b"])));
        let root_only = manager.effective(&inst, &ScopePath::root()).unwrap();
        assert_eq!(root_only.get("known_facts"), Some(&json!(["a"])));
    }

    #[test]
    fn rendering_is_deterministic_and_role_filtered() {
        let schema = ContextSchema::default().with_field(
            "qa_notes",
            FieldSpec::new(FieldShape::List, MergePolicy::Append).visible_to(["qa"]),
        );
        let manager = ContextStateManager::new(schema);
        let mut state = ContextState::default();
        manager
            .apply(
                &mut state,
                &ContextDelta::new("d")
                    .set("qa_notes", json!(["check tenancy"]))
                    .set("prior_answers", json!({"b": 2, "a": "one"}))
                    .set("known_facts", json!(["B2B"])),
            )
            .unwrap();

        let pm = manager.render_for_prompt(&state, "pm", "epic_backlog");
        assert_eq!(
            pm.as_str(),
            "# Context (epic_backlog)\n\n## known_facts\n- B2B\n\n## prior_answers\n- a: one\n- b: 2\n"
        );
        assert_eq!(pm, manager.render_for_prompt(&state.clone(), "pm", "epic_backlog"));
        assert!(manager
            .render_for_prompt(&state, "qa", "review")
            .as_str()
            .contains("check tenancy"));
    }
}
