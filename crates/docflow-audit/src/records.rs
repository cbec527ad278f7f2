//! Audit record types
//!
//! One [`LlmRun`] per model invocation, plus the reference rows that point
//! into the content store by hash.

use chrono::{DateTime, Utc};
use docflow_content::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique run identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate new run ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identifier tying together every record of one logical execution
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// Fresh random correlation id
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow as string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Run outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Started, not yet completed
    Running,
    /// Model returned a response
    Success,
    /// Model call failed or timed out
    Error,
    /// Abandoned while the model call was in flight
    Cancelled,
}

impl RunStatus {
    /// Whether the run has finished
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Stored status name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a stored blob was used for in the invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Role prompt
    SystemPrompt,
    /// Full user prompt as sent
    UserPrompt,
    /// Task prompt text
    TaskPrompt,
    /// Governed input document
    ContextDoc,
    /// Rendered context state
    ContextState,
    /// QA findings carried into an attempt, or produced by one
    QaFindings,
    /// Output schema
    Schema,
    /// Raw model output
    RawText,
}

impl ContentKind {
    /// Stored kind name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SystemPrompt => "system_prompt",
            Self::UserPrompt => "user_prompt",
            Self::TaskPrompt => "task_prompt",
            Self::ContextDoc => "context_doc",
            Self::ContextState => "context_state",
            Self::QaFindings => "qa_findings",
            Self::Schema => "schema",
            Self::RawText => "raw_text",
        }
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token counts reported by the model provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens
    pub input_tokens: u64,
    /// Completion tokens
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Create usage
    #[inline]
    #[must_use]
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Input plus output tokens
    #[inline]
    #[must_use]
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// One model invocation (`llm_run` row)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRun {
    /// Run ID
    pub id: RunId,
    /// Correlation ID
    pub correlation_id: CorrelationId,
    /// Model identifier
    pub model: String,
    /// Role the step ran as
    pub role: String,
    /// Document type produced
    pub artifact_type: String,
    /// When the run was staged
    pub started_at: DateTime<Utc>,
    /// Set on completion
    pub completed_at: Option<DateTime<Utc>>,
    /// Prompt tokens, once known
    pub input_tokens: Option<u64>,
    /// Completion tokens, once known
    pub output_tokens: Option<u64>,
    /// Current status
    pub status: RunStatus,
    /// Errors reported for this run
    pub error_count: u32,
    /// Code of the first reported error
    pub primary_error_code: Option<String>,
    /// Message of the first reported error
    pub primary_error_message: Option<String>,
    /// Whether this run re-executed another
    pub is_replay: bool,
    /// Run this one replayed
    pub original_run_id: Option<RunId>,
    /// Model parameters exactly as sent
    pub parameters: serde_json::Value,
    /// Free-form audit labels (prompt fingerprints, step, scope)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl LlmRun {
    /// Token usage when both counts are recorded
    #[inline]
    #[must_use]
    pub fn usage(&self) -> Option<TokenUsage> {
        match (self.input_tokens, self.output_tokens) {
            (Some(input), Some(output)) => Some(TokenUsage::new(input, output)),
            _ => None,
        }
    }
}

/// Run → content reference for an input (`llm_run_input_ref` row)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRef {
    /// Owning run
    pub run_id: RunId,
    /// What the blob was used for
    pub kind: ContentKind,
    /// Position among the run's inputs
    pub ordinal: u32,
    /// Key into the content store
    pub content_hash: ContentHash,
}

/// Run → content reference for an output (`llm_run_output_ref` row)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    /// Owning run
    pub run_id: RunId,
    /// What the blob holds
    pub kind: ContentKind,
    /// Position among the run's outputs
    pub ordinal: u32,
    /// Key into the content store
    pub content_hash: ContentHash,
}

/// One reported error (`llm_run_error` row)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    /// Owning run
    pub run_id: RunId,
    /// 1-based position among the run's errors
    pub sequence: u32,
    /// Error code
    pub code: String,
    /// Error message
    pub message: String,
    /// When the error was reported
    pub occurred_at: DateTime<Utc>,
}

/// A run with all of its reference rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDetail {
    /// The run row
    pub run: LlmRun,
    /// Input references, by ordinal
    pub inputs: Vec<InputRef>,
    /// Output references, by ordinal
    pub outputs: Vec<OutputRef>,
    /// Error rows, by sequence
    pub errors: Vec<RunError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ContentKind::SystemPrompt).unwrap();
        assert_eq!(json, "\"system_prompt\"");
        assert_eq!(ContentKind::QaFindings.to_string(), "qa_findings");
    }

    #[test]
    fn usage_total() {
        assert_eq!(TokenUsage::new(4012, 900).total(), 4912);
    }

    #[test]
    fn run_id_parses() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
