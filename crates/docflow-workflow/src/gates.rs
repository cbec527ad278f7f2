//! Clarification and QA gates
//!
//! Business rules per task plug in through [`TaskHandler`]. The engine only
//! decides when each gate runs and what its verdict does to the step.

use crate::context::{ContextDelta, ContextState};
use crate::request::GatheredInput;
use crate::scope::ScopePath;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A question that must be answered before primary generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationQuestion {
    /// Question ID, key of the answer
    pub id: String,
    /// Question text
    pub text: String,
}

impl ClarificationQuestion {
    /// Create question
    #[must_use]
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// Finding severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Advisory only
    Info,
    /// Worth a look
    Warning,
    /// Blocks acceptance
    #[default]
    Error,
}

/// One QA finding, carried into the next attempt as structured input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaFinding {
    /// Machine-readable finding code
    pub code: String,
    /// Human-readable detail
    pub message: String,
    /// Finding severity
    #[serde(default)]
    pub severity: Severity,
}

impl QaFinding {
    /// Finding with `Severity::Error`
    #[must_use]
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            severity: Severity::Error,
        }
    }
}

/// QA gate outcome; `passed == false` is a veto
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaVerdict {
    /// Whether the gate let the output through
    pub passed: bool,
    /// Findings behind the verdict
    #[serde(default)]
    pub findings: Vec<QaFinding>,
}

impl QaVerdict {
    /// Passing verdict with no findings
    #[must_use]
    pub fn pass() -> Self {
        Self {
            passed: true,
            findings: Vec::new(),
        }
    }

    /// Veto carrying `findings`
    #[must_use]
    pub fn veto(findings: Vec<QaFinding>) -> Self {
        Self {
            passed: false,
            findings,
        }
    }
}

/// What a gate sees of the step it guards
#[derive(Debug, Clone, Copy)]
pub struct GateContext<'a> {
    /// Guarded step
    pub step_id: &'a str,
    /// Role the step runs as
    pub role: &'a str,
    /// Task prompt name
    pub task: &'a str,
    /// Document type produced
    pub doc_type: &'a str,
    /// Scope the step runs at
    pub scope: &'a ScopePath,
    /// Effective context state at `scope`
    pub context: &'a ContextState,
    /// Gathered input documents
    pub inputs: &'a [GatheredInput],
    /// 1-based attempt number; 0 before the first model call
    pub attempt: u32,
}

/// Task-specific gate logic
#[async_trait]
pub trait TaskHandler: Send + Sync + std::fmt::Debug {
    /// Questions to ask before generation; answered ones are filtered out by the caller
    async fn clarification_questions(&self, _ctx: &GateContext<'_>) -> Vec<ClarificationQuestion> {
        Vec::new()
    }

    /// QA verdict on a model output
    async fn evaluate(&self, ctx: &GateContext<'_>, output: &str) -> QaVerdict;

    /// Structured facts to merge into context once the output is accepted
    fn context_delta(&self, _ctx: &GateContext<'_>, _output: &str) -> Option<ContextDelta> {
        None
    }
}

/// Asks nothing; vetoes only empty output
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTaskHandler;

#[async_trait]
impl TaskHandler for DefaultTaskHandler {
    async fn evaluate(&self, ctx: &GateContext<'_>, output: &str) -> QaVerdict {
        if output.trim().is_empty() {
            QaVerdict::veto(vec![QaFinding::error(
                "empty_output",
                format!("{} produced no content", ctx.doc_type),
            )])
        } else {
            QaVerdict::pass()
        }
    }
}

/// Handlers by name, with a fallback
#[derive(Debug, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    fallback: Arc<dyn TaskHandler>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(DefaultTaskHandler),
        }
    }
}

impl HandlerRegistry {
    /// Registry with only the default handler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Replace the fallback handler
    #[must_use]
    pub fn with_fallback(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.fallback = handler;
        self
    }

    /// Handler registered under `name`, else the fallback
    #[must_use]
    pub fn resolve(&self, name: &str) -> Arc<dyn TaskHandler> {
        self.handlers
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct AlwaysVeto;

    #[async_trait]
    impl TaskHandler for AlwaysVeto {
        async fn evaluate(&self, _ctx: &GateContext<'_>, _output: &str) -> QaVerdict {
            QaVerdict::veto(vec![QaFinding::error("nope", "never good enough")])
        }
    }

    fn ctx<'a>(scope: &'a ScopePath, state: &'a ContextState) -> GateContext<'a> {
        GateContext {
            step_id: "discovery",
            role: "pm",
            task: "discovery",
            doc_type: "discovery",
            scope,
            context: state,
            inputs: &[],
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn default_handler_vetoes_blank_output_only() {
        let scope = ScopePath::root();
        let state = ContextState::default();
        let handler = DefaultTaskHandler;
        assert!(handler.evaluate(&ctx(&scope, &state), "{\"ok\":true}").await.passed);
        let verdict = handler.evaluate(&ctx(&scope, &state), "  \n").await;
        assert!(!verdict.passed);
        assert_eq!(verdict.findings[0].code, "empty_output");
        assert!(handler.clarification_questions(&ctx(&scope, &state)).await.is_empty());
    }

    #[tokio::test]
    async fn registry_falls_back() {
        let registry = HandlerRegistry::new().with("review", Arc::new(AlwaysVeto));
        let scope = ScopePath::root();
        let state = ContextState::default();
        assert!(!registry.resolve("review").evaluate(&ctx(&scope, &state), "x").await.passed);
        assert!(registry.resolve("discovery").evaluate(&ctx(&scope, &state), "x").await.passed);
    }
}
