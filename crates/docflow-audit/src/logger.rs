//! Execution logger
//!
//! Records one run per model invocation into a caller-owned [`AuditTx`].
//! The logger hashes content and stages reference rows; it never commits.
//! Whoever owns the logical operation (a step attempt, a replay) decides when
//! the transaction is handed to the store.

use crate::records::{
    ContentKind, CorrelationId, InputRef, LlmRun, OutputRef, RunId, RunStatus, TokenUsage,
};
use crate::tx::{AuditOp, AuditTx};
use chrono::Utc;
use docflow_content::{ContentHash, ContentRecord};
use std::collections::BTreeMap;

/// Parameters of a run about to start
#[derive(Debug, Clone)]
pub struct NewRun {
    /// Model identifier sent to the provider
    pub model: String,
    /// Role the step ran as
    pub role: String,
    /// Document type being produced
    pub artifact_type: String,
    /// Ties the run to its workflow execution
    pub correlation_id: CorrelationId,
    /// Model parameters exactly as sent
    pub parameters: serde_json::Value,
    /// Audit labels
    pub metadata: BTreeMap<String, String>,
    /// Original run when this is a replay
    pub replay_of: Option<RunId>,
}

impl NewRun {
    /// Run with no parameters or labels
    #[must_use]
    pub fn new(
        model: impl Into<String>,
        role: impl Into<String>,
        artifact_type: impl Into<String>,
        correlation_id: impl Into<CorrelationId>,
    ) -> Self {
        Self {
            model: model.into(),
            role: role.into(),
            artifact_type: artifact_type.into(),
            correlation_id: correlation_id.into(),
            parameters: serde_json::Value::Null,
            metadata: BTreeMap::new(),
            replay_of: None,
        }
    }

    /// With model parameters
    #[must_use]
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// With one audit label
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Mark as a replay of `original`
    #[must_use]
    pub fn replay_of(mut self, original: RunId) -> Self {
        self.replay_of = Some(original);
        self
    }
}

/// Stages run records into audit transactions
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionLogger;

impl ExecutionLogger {
    /// Create logger
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Stage a new run in `Running` status
    pub fn start_run(&self, tx: &mut AuditTx, run: NewRun) -> RunId {
        let id = RunId::new();
        tracing::debug!(
            run_id = %id,
            correlation_id = %run.correlation_id,
            model = %run.model,
            role = %run.role,
            artifact_type = %run.artifact_type,
            "run started"
        );
        tx.push(AuditOp::InsertRun(LlmRun {
            id,
            correlation_id: run.correlation_id,
            model: run.model,
            role: run.role,
            artifact_type: run.artifact_type,
            started_at: Utc::now(),
            completed_at: None,
            input_tokens: None,
            output_tokens: None,
            status: RunStatus::Running,
            error_count: 0,
            primary_error_code: None,
            primary_error_message: None,
            is_replay: run.replay_of.is_some(),
            original_run_id: run.replay_of,
            parameters: run.parameters,
            metadata: run.metadata,
        }));
        id
    }

    /// Stage an input blob and its reference row
    pub fn add_input(
        &self,
        tx: &mut AuditTx,
        run_id: RunId,
        kind: ContentKind,
        text: &str,
        ordinal: u32,
    ) -> ContentHash {
        let record = ContentRecord::new(text);
        let content_hash = record.content_hash;
        tx.push(AuditOp::StageContent(record));
        tx.push(AuditOp::InputRef(InputRef {
            run_id,
            kind,
            ordinal,
            content_hash,
        }));
        content_hash
    }

    /// Stage an output blob; ordinals are assigned in call order
    pub fn add_output(&self, tx: &mut AuditTx, run_id: RunId, kind: ContentKind, text: &str) -> ContentHash {
        let ordinal = tx.next_output_ordinal(run_id);
        let record = ContentRecord::new(text);
        let content_hash = record.content_hash;
        tx.push(AuditOp::StageContent(record));
        tx.push(AuditOp::OutputRef(OutputRef {
            run_id,
            kind,
            ordinal,
            content_hash,
        }));
        content_hash
    }

    /// Stage the terminal status and token counts
    pub fn complete_run(&self, tx: &mut AuditTx, run_id: RunId, usage: TokenUsage, status: RunStatus) {
        self.finish(tx, run_id, Some(usage), status);
    }

    /// Stage a terminal status for a run that produced no usage figures
    pub fn abandon_run(&self, tx: &mut AuditTx, run_id: RunId, status: RunStatus) {
        self.finish(tx, run_id, None, status);
    }

    /// Stage an error row; the run's rolling counters move in the same commit
    pub fn log_error(&self, tx: &mut AuditTx, run_id: RunId, code: impl Into<String>, message: impl Into<String>) {
        let code = code.into();
        let message = message.into();
        tracing::debug!(run_id = %run_id, code = %code, "run error staged");
        tx.push(AuditOp::RecordError {
            run_id,
            code,
            message,
            occurred_at: Utc::now(),
        });
    }

    fn finish(&self, tx: &mut AuditTx, run_id: RunId, usage: Option<TokenUsage>, status: RunStatus) {
        tracing::debug!(run_id = %run_id, status = ?status, "run completion staged");
        tx.push(AuditOp::CompleteRun {
            run_id,
            usage,
            status,
            completed_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AuditStore, MemoryAuditStore};

    #[tokio::test]
    async fn full_run_lifecycle() {
        let store = MemoryAuditStore::new();
        let logger = ExecutionLogger::new();
        let mut tx = AuditTx::begin();

        let run_id = logger.start_run(
            &mut tx,
            NewRun::new("model-a", "architect", "architecture_spec", "corr-9")
                .with_parameters(serde_json::json!({"temperature": 0.2}))
                .with_metadata("step_id", "architecture"),
        );
        logger.add_input(&mut tx, run_id, ContentKind::SystemPrompt, "You are the architect.", 0);
        logger.add_input(&mut tx, run_id, ContentKind::UserPrompt, "Design it.", 1);
        logger.add_output(&mut tx, run_id, ContentKind::RawText, "{\"components\": []}");
        logger.complete_run(&mut tx, run_id, TokenUsage::new(120, 30), RunStatus::Success);

        let receipt = store.commit(tx).await.unwrap();
        assert_eq!(receipt.runs_inserted, 1);
        assert_eq!(receipt.refs_written, 3);

        let detail = store.run_detail(run_id).await.unwrap();
        assert_eq!(detail.run.status, RunStatus::Success);
        assert_eq!(detail.run.input_tokens, Some(120));
        assert_eq!(detail.run.metadata.get("step_id").map(String::as_str), Some("architecture"));
        assert_eq!(detail.inputs.len(), 2);
        assert_eq!(detail.outputs[0].ordinal, 0);
    }

    #[tokio::test]
    async fn errors_bump_counters_in_same_commit() {
        let store = MemoryAuditStore::new();
        let logger = ExecutionLogger::new();

        let mut tx = AuditTx::begin();
        let run_id = logger.start_run(&mut tx, NewRun::new("m", "qa", "backlog", "c"));
        store.commit(tx).await.unwrap();

        let mut tx = AuditTx::begin();
        logger.log_error(&mut tx, run_id, "timeout", "model call exceeded 120s");
        logger.log_error(&mut tx, run_id, "provider", "503");
        store.commit(tx).await.unwrap();

        let detail = store.run_detail(run_id).await.unwrap();
        assert_eq!(detail.run.error_count, 2);
        assert_eq!(detail.run.primary_error_code.as_deref(), Some("timeout"));
        assert_eq!(detail.errors.len(), 2);
        assert_eq!(detail.errors[1].sequence, 2);
    }

    #[tokio::test]
    async fn concurrent_error_reports_never_lose_counts() {
        let store = std::sync::Arc::new(MemoryAuditStore::new());
        let logger = ExecutionLogger::new();

        let mut tx = AuditTx::begin();
        let run_id = logger.start_run(&mut tx, NewRun::new("m", "qa", "backlog", "c"));
        store.commit(tx).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut tx = AuditTx::begin();
                logger.log_error(&mut tx, run_id, "provider", format!("failure {i}"));
                store.commit(tx).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let detail = store.run_detail(run_id).await.unwrap();
        assert_eq!(detail.run.error_count, 16);
        let mut sequences: Vec<u32> = detail.errors.iter().map(|e| e.sequence).collect();
        sequences.dedup();
        assert_eq!(sequences, (1..=16).collect::<Vec<_>>());
    }
}
