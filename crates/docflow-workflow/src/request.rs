//! Model request assembly
//!
//! A request is built only from typed sections. There is no section type for
//! conversation history, and [`TranscriptGuard`] rejects any non-document
//! section that carries raw output of an earlier attempt.

use crate::error::ContaminationViolation;
use crate::gates::QaFinding;
use crate::scope::ScopePath;
use docflow_content::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Context state rendered for one role and task
///
/// Only [`ContextStateManager::render_for_prompt`](crate::context::ContextStateManager::render_for_prompt)
/// creates these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContext(String);

impl RenderedContext {
    pub(crate) fn new(text: String) -> Self {
        Self(text)
    }

    /// Rendered text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An input resolved for a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatheredInput {
    /// A governed document from this scope or an ancestor
    Document {
        doc_type: String,
        scope: ScopePath,
        content: String,
        content_hash: ContentHash,
    },
    /// The iteration item of the current scope
    Item {
        entity_type: String,
        item_id: String,
        data: serde_json::Value,
    },
}

/// One typed part of a request
#[derive(Debug, Clone, PartialEq)]
pub enum PromptSection {
    /// Context state as the role sees it
    RenderedContext(RenderedContext),
    /// A governed input document
    InputDocument {
        doc_type: String,
        scope: ScopePath,
        content: String,
    },
    /// The current iteration item
    IterationItem {
        entity_type: String,
        item_id: String,
        data: serde_json::Value,
    },
    /// Findings of the previous attempt or a rejection
    QaFindings(Vec<QaFinding>),
    /// The task prompt for this turn
    CurrentInput(String),
}

impl PromptSection {
    /// Section name used in contamination reports
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RenderedContext(_) => "rendered_context",
            Self::InputDocument { .. } => "input_document",
            Self::IterationItem { .. } => "iteration_item",
            Self::QaFindings(_) => "qa_findings",
            Self::CurrentInput(_) => "current_input",
        }
    }

    fn render(&self, out: &mut String) {
        match self {
            Self::RenderedContext(ctx) => out.push_str(ctx.as_str()),
            Self::InputDocument {
                doc_type,
                scope,
                content,
            } => {
                let _ = writeln!(out, "# Input document: {doc_type} ({scope})");
                out.push_str(content);
                out.push('\n');
            }
            Self::IterationItem {
                entity_type,
                item_id,
                data,
            } => {
                let _ = writeln!(out, "# Current {entity_type}: {item_id}");
                let _ = writeln!(out, "{data}");
            }
            Self::QaFindings(findings) => {
                let _ = writeln!(out, "# Findings to address");
                for finding in findings {
                    let _ = writeln!(out, "- [{}] {}", finding.code, finding.message);
                }
            }
            Self::CurrentInput(text) => {
                let _ = writeln!(out, "# Task");
                out.push_str(text);
                out.push('\n');
            }
        }
    }

    /// Text the guard inspects; governed documents are exempt
    fn guarded_text(&self) -> Option<String> {
        match self {
            Self::InputDocument { .. } => None,
            other => {
                let mut text = String::new();
                other.render(&mut text);
                Some(text)
            }
        }
    }
}

/// A complete, stateless request for one step attempt
#[derive(Debug, Clone, PartialEq)]
pub struct StepRequest {
    /// Role prompt
    pub system_prompt: String,
    /// Typed sections, in order
    pub sections: Vec<PromptSection>,
}

impl StepRequest {
    /// Request with no sections
    #[must_use]
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            sections: Vec::new(),
        }
    }

    /// Append a section
    #[must_use]
    pub fn section(mut self, section: PromptSection) -> Self {
        self.sections.push(section);
        self
    }

    /// Sections joined in order, blank line between each
    #[must_use]
    pub fn user_prompt(&self) -> String {
        let mut out = String::new();
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            section.render(&mut out);
        }
        out
    }
}

/// Minimum length for substring matching; shorter outputs must match a whole section
const MIN_MATCH_LEN: usize = 24;

/// Tracks raw outputs that must never re-enter a request
#[derive(Debug, Clone, Default)]
pub struct TranscriptGuard {
    tainted: Vec<String>,
}

impl TranscriptGuard {
    /// Empty guard
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a raw model output
    pub fn record_output(&mut self, text: &str) {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            self.tainted.push(trimmed.to_string());
        }
    }

    /// Check every section except governed input documents
    ///
    /// # Errors
    /// `ContaminationViolation` naming the first offending section.
    pub fn check(&self, step_id: &str, request: &StepRequest) -> Result<(), ContaminationViolation> {
        if self.tainted.is_empty() {
            return Ok(());
        }
        let system = std::iter::once(("system_prompt", Some(request.system_prompt.clone())));
        let sections = request.sections.iter().map(|s| (s.kind(), s.guarded_text()));
        for (section, text) in system.chain(sections) {
            let Some(text) = text else { continue };
            if self.carries_output(&text) {
                tracing::error!(step_id, section, "raw model output in request section");
                return Err(ContaminationViolation {
                    step_id: step_id.to_string(),
                    section,
                });
            }
        }
        Ok(())
    }

    fn carries_output(&self, text: &str) -> bool {
        self.tainted.iter().any(|output| {
            if output.len() >= MIN_MATCH_LEN {
                text.contains(output.as_str())
            } else {
                text.trim() == output
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = "{\"epics\": [{\"id\": \"E1\", \"title\": \"Onboarding\"}]}";

    fn base() -> StepRequest {
        StepRequest::new("You are the Product Manager.")
            .section(PromptSection::RenderedContext(RenderedContext::new(
                "# Context (epic_backlog)\n".into(),
            )))
            .section(PromptSection::CurrentInput("Write the epic backlog.".into()))
    }

    #[test]
    fn user_prompt_orders_sections() {
        let prompt = base()
            .section(PromptSection::QaFindings(vec![QaFinding::error("E1", "missing epics")]))
            .user_prompt();
        let ctx = prompt.find("# Context").unwrap();
        let task = prompt.find("# Task").unwrap();
        let findings = prompt.find("- [E1] missing epics").unwrap();
        assert!(ctx < task && task < findings);
    }

    #[test]
    fn governed_document_may_carry_prior_output() {
        let mut guard = TranscriptGuard::new();
        guard.record_output(RAW);
        let request = base().section(PromptSection::InputDocument {
            doc_type: "epic_backlog".into(),
            scope: ScopePath::root(),
            content: RAW.into(),
        });
        assert!(guard.check("epic_detail", &request).is_ok());
    }

    #[test]
    fn raw_output_in_current_input_is_contamination() {
        let mut guard = TranscriptGuard::new();
        guard.record_output(RAW);
        let request = base().section(PromptSection::CurrentInput(format!(
            "Previously you said: {RAW}. Improve it."
        )));
        let err = guard.check("epic_backlog", &request).unwrap_err();
        assert_eq!(err.section, "current_input");
    }

    #[test]
    fn short_outputs_only_match_whole_sections() {
        let mut guard = TranscriptGuard::new();
        guard.record_output("ok");
        assert!(guard.check("s", &base()).is_ok());
        let request = base().section(PromptSection::CurrentInput("ok".into()));
        assert!(guard.check("s", &request).is_err());
    }
}
