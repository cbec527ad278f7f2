//! Step state machine
//!
//! Statuses move only along the edges of [`allowed_transitions`]. Every move
//! is appended to the step's history with its cause.

use crate::context::ContextDelta;
use crate::gates::{ClarificationQuestion, QaFinding};
use crate::scope::ScopePath;
use chrono::{DateTime, Utc};
use docflow_audit::RunId;
use docflow_content::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not entered yet
    Pending,
    /// Waiting for answers
    AwaitingClarification,
    /// Model call and QA in flight
    Executing,
    /// Candidate waiting for a role to accept it
    AwaitingAcceptance,
    /// Iteration block with some items done
    Partial,
    /// Done
    Completed,
    /// Failed; see the recorded reason
    Failed,
}

impl StepStatus {
    /// Stored status name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AwaitingClarification => "awaiting_clarification",
            Self::Executing => "executing",
            Self::AwaitingAcceptance => "awaiting_acceptance",
            Self::Partial => "partial",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Waiting on a human
    #[must_use]
    pub fn is_paused(self) -> bool {
        matches!(self, Self::AwaitingClarification | Self::AwaitingAcceptance)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statuses reachable from `from` in one move
#[must_use]
pub fn allowed_transitions(from: StepStatus) -> &'static [StepStatus] {
    use StepStatus::{
        AwaitingAcceptance, AwaitingClarification, Completed, Executing, Failed, Partial, Pending,
    };
    match from {
        Pending => &[AwaitingClarification, Executing, Partial, Completed, Failed],
        AwaitingClarification => &[Executing, Failed],
        Executing => &[AwaitingAcceptance, Completed, Failed],
        AwaitingAcceptance => &[Completed, Pending],
        Partial => &[AwaitingAcceptance, Completed, Failed],
        Completed => &[Pending],
        Failed => &[Pending],
    }
}

/// Illegal status move
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition for step {step_id}: {from} -> {to}")]
pub struct TransitionError {
    /// Step that tried to move
    pub step_id: String,
    /// Current status
    pub from: StepStatus,
    /// Requested status
    pub to: StepStatus,
}

/// Check one move against the table
///
/// # Errors
/// `TransitionError` when `to` is not reachable from `from`.
pub fn validate_transition(step_id: &str, from: StepStatus, to: StepStatus) -> Result<(), TransitionError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError {
            step_id: step_id.to_string(),
            from,
            to,
        })
    }
}

/// What drove a transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum TransitionCause {
    /// The executor entered the step
    Entered,
    /// Clarification answers arrived
    AnswersReceived,
    /// The model returned output
    ModelCompleted,
    /// A QA gate decided
    QaVerdict { passed: bool },
    /// A role accepted the candidate
    Accepted { role: String },
    /// A role rejected the candidate
    Rejected { role: String },
    /// Iteration progress on a block
    ItemsProgressed { completed: usize, total: usize },
    /// The step failed
    Failure,
    /// A failed step was reset
    Retry,
    /// A completed step was reopened
    Regenerate,
}

/// One entry of a step's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Status before
    pub from: StepStatus,
    /// Status after
    pub to: StepStatus,
    /// What drove it
    #[serde(flatten)]
    pub cause: TransitionCause,
    /// When it happened
    pub at: DateTime<Utc>,
    /// Instance-wide sequence number, for ordering across steps
    pub seq: u64,
}

/// Structured reason a step failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// A required input document is absent
    MissingInput { doc_type: String, scope: ScopePath },
    /// The model call failed or timed out
    ModelInvocation { code: String, message: String },
    /// Every QA attempt was vetoed
    QaRemediationExhausted { attempts: u32, findings: Vec<QaFinding> },
    /// Raw model output reached a request section
    Contamination { section: String },
    /// The collection field could not be read
    InvalidCollection { message: String },
    /// Stored as `failed` without a reason, e.g. by an older snapshot
    Unrecorded,
}

impl FailureReason {
    /// Stored reason code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingInput { .. } => "missing_input",
            Self::ModelInvocation { .. } => "model_invocation",
            Self::QaRemediationExhausted { .. } => "qa_remediation_exhausted",
            Self::Contamination { .. } => "contamination",
            Self::InvalidCollection { .. } => "invalid_collection",
            Self::Unrecorded => "unrecorded",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingInput { doc_type, scope } => {
                write!(f, "missing input {doc_type} at {scope}")
            }
            Self::ModelInvocation { code, message } => {
                write!(f, "model invocation failed ({code}): {message}")
            }
            Self::QaRemediationExhausted { attempts, .. } => {
                write!(f, "QA remediation exhausted after {attempts} attempts")
            }
            Self::Contamination { section } => {
                write!(f, "raw model output found in {section} section")
            }
            Self::InvalidCollection { message } => write!(f, "invalid collection: {message}"),
            Self::Unrecorded => f.write_str("failed without a recorded reason"),
        }
    }
}

/// Output that passed QA and awaits acceptance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Candidate text
    pub content: String,
    /// Hash of `content`
    pub content_hash: ContentHash,
    /// Run that produced it
    pub run_id: RunId,
    /// Hashes of the input documents it was generated from
    #[serde(default)]
    pub depends_on: BTreeMap<String, ContentHash>,
    /// Delta applied on acceptance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_delta: Option<ContextDelta>,
}

/// Persisted state of one step in one scope context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    /// Step ID
    pub step_id: String,
    /// Scope the step runs at
    pub scope: ScopePath,
    /// Current status
    pub status: StepStatus,
    /// Model calls made since the step last entered `pending`
    #[serde(default)]
    pub attempts: u32,
    /// Open clarification questions
    #[serde(default)]
    pub questions: Vec<ClarificationQuestion>,
    /// Answers, by question ID
    #[serde(default)]
    pub answers: BTreeMap<String, String>,
    /// Structured feedback carried into the next attempt
    #[serde(default)]
    pub feedback: Vec<QaFinding>,
    /// Output awaiting acceptance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Candidate>,
    /// Roles that may accept the candidate
    #[serde(default)]
    pub accepted_by: Vec<String>,
    /// Why the step failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    /// Last model run of the step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_id: Option<RunId>,
    /// Transitions, oldest first
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl StepState {
    /// Pending state with no history
    #[must_use]
    pub fn new(step_id: impl Into<String>, scope: ScopePath) -> Self {
        Self {
            step_id: step_id.into(),
            scope,
            status: StepStatus::Pending,
            attempts: 0,
            questions: Vec::new(),
            answers: BTreeMap::new(),
            feedback: Vec::new(),
            candidate: None,
            accepted_by: Vec::new(),
            failure: None,
            last_run_id: None,
            history: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Why a `failed` step failed; `None` in any other status
    #[must_use]
    pub fn failure_reason(&self) -> Option<FailureReason> {
        (self.status == StepStatus::Failed).then(|| self.failure.clone().unwrap_or(FailureReason::Unrecorded))
    }

    /// Move to `to`, recording `cause`
    ///
    /// # Errors
    /// `TransitionError` for a move outside the table; state is untouched.
    pub fn transition(&mut self, to: StepStatus, cause: TransitionCause, seq: u64) -> Result<(), TransitionError> {
        validate_transition(&self.step_id, self.status, to)?;
        let at = Utc::now();
        tracing::debug!(
            step_id = %self.step_id,
            scope = %self.scope,
            from = %self.status,
            to = %to,
            "step transition"
        );
        self.history.push(TransitionRecord {
            from: self.status,
            to,
            cause,
            at,
            seq,
        });
        self.status = to;
        self.updated_at = at;
        if to == StepStatus::Pending {
            self.attempts = 0;
            self.failure = None;
            self.candidate = None;
            self.questions.clear();
        }
        Ok(())
    }

    /// Questions without an answer yet
    #[must_use]
    pub fn unanswered(&self) -> Vec<&ClarificationQuestion> {
        self.questions
            .iter()
            .filter(|q| !self.answers.contains_key(&q.id))
            .collect()
    }

    /// Sequence number of the first move into `status`, if any
    #[must_use]
    pub fn first_entered(&self, status: StepStatus) -> Option<u64> {
        self.history.iter().find(|t| t.to == status).map(|t| t.seq)
    }

    /// Sequence number of the latest move into `status`, if any
    #[must_use]
    pub fn last_entered(&self, status: StepStatus) -> Option<u64> {
        self.history.iter().rev().find(|t| t.to == status).map(|t| t.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [StepStatus; 7] = [
        StepStatus::Pending,
        StepStatus::AwaitingClarification,
        StepStatus::Executing,
        StepStatus::AwaitingAcceptance,
        StepStatus::Partial,
        StepStatus::Completed,
        StepStatus::Failed,
    ];

    #[test]
    fn failed_states_always_carry_a_reason() {
        let mut state = StepState::new("per_epic", ScopePath::root());
        assert_eq!(state.failure_reason(), None);
        state.status = StepStatus::Failed;
        assert_eq!(state.failure_reason(), Some(FailureReason::Unrecorded));
        state.failure = Some(FailureReason::InvalidCollection {
            message: "field epics is not an array".into(),
        });
        assert_eq!(state.failure_reason().map(|r| r.code()), Some("invalid_collection"));
    }

    #[test]
    fn happy_path_with_gates() {
        let mut state = StepState::new("discovery", ScopePath::root());
        state
            .transition(StepStatus::AwaitingClarification, TransitionCause::Entered, 1)
            .unwrap();
        state
            .transition(StepStatus::Executing, TransitionCause::AnswersReceived, 2)
            .unwrap();
        state
            .transition(
                StepStatus::AwaitingAcceptance,
                TransitionCause::QaVerdict { passed: true },
                3,
            )
            .unwrap();
        state
            .transition(
                StepStatus::Completed,
                TransitionCause::Accepted {
                    role: "product_owner".into(),
                },
                4,
            )
            .unwrap();
        assert_eq!(state.history.len(), 4);
        assert_eq!(state.first_entered(StepStatus::Executing), Some(2));
    }

    #[test]
    fn completed_cannot_jump_to_executing() {
        let mut state = StepState::new("discovery", ScopePath::root());
        state.transition(StepStatus::Executing, TransitionCause::Entered, 1).unwrap();
        state.transition(StepStatus::Completed, TransitionCause::ModelCompleted, 2).unwrap();
        let err = state
            .transition(StepStatus::Executing, TransitionCause::Entered, 3)
            .unwrap_err();
        assert_eq!(err.from, StepStatus::Completed);
        assert_eq!(state.status, StepStatus::Completed);
        assert_eq!(state.history.len(), 2);
    }

    #[test]
    fn returning_to_pending_clears_attempt_state() {
        let mut state = StepState::new("epic_backlog", ScopePath::root());
        state.transition(StepStatus::Executing, TransitionCause::Entered, 1).unwrap();
        state.attempts = 3;
        state.failure = Some(FailureReason::ModelInvocation {
            code: "timeout".into(),
            message: "model call timed out after 120s".into(),
        });
        state.transition(StepStatus::Failed, TransitionCause::Failure, 2).unwrap();
        state.transition(StepStatus::Pending, TransitionCause::Retry, 3).unwrap();
        assert_eq!(state.attempts, 0);
        assert!(state.failure.is_none());
    }

    fn status() -> impl Strategy<Value = StepStatus> {
        proptest::sample::select(ALL.to_vec())
    }

    proptest! {
        #[test]
        fn history_only_records_legal_moves(moves in proptest::collection::vec(status(), 0..40)) {
            let mut state = StepState::new("s", ScopePath::root());
            for (seq, to) in (0u64..).zip(moves) {
                let before = state.status;
                let result = state.transition(to, TransitionCause::Entered, seq);
                prop_assert_eq!(result.is_ok(), allowed_transitions(before).contains(&to));
            }
            for record in &state.history {
                prop_assert!(allowed_transitions(record.from).contains(&record.to));
            }
            let mut expected = StepStatus::Pending;
            for record in &state.history {
                prop_assert_eq!(record.from, expected);
                expected = record.to;
            }
            prop_assert_eq!(state.status, expected);
        }

        #[test]
        fn terminal_states_only_leave_through_pending(from in status(), to in status()) {
            if matches!(from, StepStatus::Completed | StepStatus::Failed) && to != StepStatus::Pending {
                prop_assert!(validate_transition("s", from, to).is_err());
            }
        }
    }
}
