//! Replay engine
//!
//! Rebuilds the exact input set of a logged run from the content store and
//! re-executes it. Inputs are reproduced bit-exactly; outputs are not expected
//! to match because model calls are stochastic, and the comparison says so.

use crate::error::ReplayError;
use crate::logger::{ExecutionLogger, NewRun};
use crate::model::{invoke_bounded, ModelClient, ModelRequest};
use crate::records::{ContentKind, CorrelationId, LlmRun, RunId, RunStatus};
use crate::store::AuditStore;
use crate::tx::AuditTx;
use docflow_content::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// One reconstructed input, verified against its stored hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructedInput {
    /// What the input was used for
    pub kind: ContentKind,
    /// Original position
    pub ordinal: u32,
    /// Stored hash, verified against `text`
    pub content_hash: ContentHash,
    /// Input text
    pub text: String,
}

/// Inputs of a run in original ordinal order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructedInputs {
    /// Run the inputs belong to
    pub run_id: RunId,
    /// Inputs sorted by ordinal
    pub entries: Vec<ReconstructedInput>,
}

impl ReconstructedInputs {
    /// First input of `kind`
    #[must_use]
    pub fn get(&self, kind: ContentKind) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.kind == kind)
            .map(|e| e.text.as_str())
    }

    /// Every input of `kind`, in ordinal order
    pub fn all(&self, kind: ContentKind) -> impl Iterator<Item = &ReconstructedInput> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }

    /// Inputs grouped by kind, each group in ordinal order
    #[must_use]
    pub fn by_kind(&self) -> BTreeMap<ContentKind, Vec<&str>> {
        let mut grouped: BTreeMap<ContentKind, Vec<&str>> = BTreeMap::new();
        for entry in &self.entries {
            grouped.entry(entry.kind).or_default().push(&entry.text);
        }
        grouped
    }

    /// Number of inputs
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the run logged no inputs
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Output comparison between an original run and its replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputComparison {
    /// Raw output hash of the original, if it logged one
    pub original_hash: Option<ContentHash>,
    /// Raw output hash of the replay
    pub replay_hash: ContentHash,
    /// Whether both outputs are identical
    pub same_hash: bool,
    /// Replay byte length minus original byte length
    pub length_delta: i64,
    /// Always `true`: differing outputs are expected, not a failure
    pub divergence_expected: bool,
}

/// Structured result of a replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayComparison {
    /// Run that was replayed
    pub original_run_id: RunId,
    /// Run created by the replay
    pub replay_run_id: RunId,
    /// New minus original; `None` when the original recorded no usage
    pub input_tokens_delta: Option<i64>,
    /// Output tokens, new minus original
    pub output_tokens_delta: Option<i64>,
    /// Total tokens, new minus original
    pub total_tokens_delta: Option<i64>,
    /// Output comparison
    pub output: OutputComparison,
}

/// New run id plus comparison
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayOutcome {
    /// Run created by the replay
    pub new_run_id: RunId,
    /// Fresh correlation id of the replay
    pub correlation_id: CorrelationId,
    /// Comparison against the original
    pub comparison: ReplayComparison,
}

/// Reconstructs and re-executes logged runs
#[derive(Debug, Clone)]
pub struct ReplayEngine {
    store: Arc<dyn AuditStore>,
    model: Arc<dyn ModelClient>,
    logger: ExecutionLogger,
    timeout: Duration,
}

impl ReplayEngine {
    /// Engine over `store`, calling `model` with a 120 s deadline
    #[must_use]
    pub fn new(store: Arc<dyn AuditStore>, model: Arc<dyn ModelClient>) -> Self {
        Self {
            store,
            model,
            logger: ExecutionLogger::new(),
            timeout: Duration::from_secs(120),
        }
    }

    /// With model call deadline
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Inputs of `run_id` joined to content, ordered by ordinal
    ///
    /// # Errors
    /// `RunNotFound` for an unknown run, `AmbiguousOrdering` when two refs
    /// share an ordinal, `IntegrityViolation` when content fails re-hashing.
    pub async fn reconstruct_inputs(&self, run_id: RunId) -> Result<ReconstructedInputs, ReplayError> {
        let refs = self.store.input_refs(run_id).await?;

        let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
        for input in &refs {
            *counts.entry(input.ordinal).or_default() += 1;
        }
        if let Some((&ordinal, &count)) = counts.iter().find(|(_, &count)| count > 1) {
            return Err(ReplayError::AmbiguousOrdering {
                run_id,
                ordinal,
                count,
            });
        }

        let content = self.store.content();
        let mut entries = Vec::with_capacity(refs.len());
        for input in refs {
            let text = content.get(&input.content_hash).await?;
            let actual = ContentHash::of_text(&text);
            if actual != input.content_hash {
                return Err(ReplayError::IntegrityViolation {
                    run_id,
                    ordinal: input.ordinal,
                    expected: input.content_hash,
                    actual,
                });
            }
            entries.push(ReconstructedInput {
                kind: input.kind,
                ordinal: input.ordinal,
                content_hash: input.content_hash,
                text,
            });
        }
        entries.sort_by_key(|e| e.ordinal);
        Ok(ReconstructedInputs { run_id, entries })
    }

    /// Re-execute `run_id` under a new correlation id and compare
    ///
    /// # Errors
    /// Reconstruction errors, `IncompleteInputs` when the system or user prompt
    /// was never logged, and `Model` when the re-execution fails (the replay
    /// run is still committed with error status).
    pub async fn replay(&self, run_id: RunId) -> Result<ReplayOutcome, ReplayError> {
        let original = self.store.get_run(run_id).await?;
        let inputs = self.reconstruct_inputs(run_id).await?;
        let request = Self::request_for(&original, &inputs)?;
        let correlation_id = CorrelationId(format!("replay-{}", uuid::Uuid::new_v4()));

        tracing::info!(
            original_run_id = %run_id,
            correlation_id = %correlation_id,
            inputs = inputs.len(),
            "replaying run"
        );

        let mut tx = AuditTx::begin();
        let mut new_run = NewRun::new(
            original.model.clone(),
            original.role.clone(),
            original.artifact_type.clone(),
            correlation_id.clone(),
        )
        .with_parameters(original.parameters.clone())
        .replay_of(run_id);
        new_run.metadata = original.metadata.clone();
        let new_run_id = self.logger.start_run(&mut tx, new_run);
        for entry in &inputs.entries {
            self.logger
                .add_input(&mut tx, new_run_id, entry.kind, &entry.text, entry.ordinal);
        }

        let response = match invoke_bounded(self.model.as_ref(), &request, self.timeout, None).await {
            Ok(response) => response,
            Err(source) => {
                self.logger
                    .log_error(&mut tx, new_run_id, source.code(), source.to_string());
                self.logger.abandon_run(&mut tx, new_run_id, RunStatus::Error);
                self.store.commit(tx).await?;
                return Err(ReplayError::Model {
                    original_run_id: run_id,
                    replay_run_id: new_run_id,
                    source,
                });
            }
        };

        let replay_hash = self
            .logger
            .add_output(&mut tx, new_run_id, ContentKind::RawText, &response.text);
        self.logger
            .complete_run(&mut tx, new_run_id, response.usage, RunStatus::Success);
        self.store.commit(tx).await?;

        let original_output = self.original_output(run_id).await?;
        let comparison = ReplayComparison {
            original_run_id: run_id,
            replay_run_id: new_run_id,
            input_tokens_delta: original
                .input_tokens
                .map(|orig| delta(response.usage.input_tokens, orig)),
            output_tokens_delta: original
                .output_tokens
                .map(|orig| delta(response.usage.output_tokens, orig)),
            total_tokens_delta: original
                .usage()
                .map(|orig| delta(response.usage.total(), orig.total())),
            output: OutputComparison {
                original_hash: original_output.as_ref().map(|(hash, _)| *hash),
                replay_hash,
                same_hash: original_output
                    .as_ref()
                    .is_some_and(|(hash, _)| *hash == replay_hash),
                length_delta: delta(
                    response.text.len() as u64,
                    original_output.as_ref().map_or(0, |(_, len)| *len as u64),
                ),
                divergence_expected: true,
            },
        };

        tracing::info!(
            original_run_id = %run_id,
            replay_run_id = %new_run_id,
            input_tokens_delta = ?comparison.input_tokens_delta,
            same_output = comparison.output.same_hash,
            "replay complete"
        );

        Ok(ReplayOutcome {
            new_run_id,
            correlation_id,
            comparison,
        })
    }

    fn request_for(run: &LlmRun, inputs: &ReconstructedInputs) -> Result<ModelRequest, ReplayError> {
        let prompt = |kind| {
            inputs
                .get(kind)
                .map(str::to_string)
                .ok_or(ReplayError::IncompleteInputs {
                    run_id: run.id,
                    kind,
                })
        };
        Ok(ModelRequest {
            system_prompt: prompt(ContentKind::SystemPrompt)?,
            user_prompt: prompt(ContentKind::UserPrompt)?,
            model: run.model.clone(),
            params: run.parameters.clone(),
        })
    }

    async fn original_output(&self, run_id: RunId) -> Result<Option<(ContentHash, usize)>, ReplayError> {
        let outputs = self.store.output_refs(run_id).await?;
        let Some(first) = outputs.into_iter().find(|o| o.kind == ContentKind::RawText) else {
            return Ok(None);
        };
        let text = self.store.content().get(&first.content_hash).await?;
        Ok(Some((first.content_hash, text.len())))
    }
}

fn delta(new: u64, original: u64) -> i64 {
    let new = i64::try_from(new).unwrap_or(i64::MAX);
    let original = i64::try_from(original).unwrap_or(i64::MAX);
    new.saturating_sub(original)
}
