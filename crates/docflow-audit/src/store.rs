//! Audit storage
//!
//! [`AuditStore`] is the shared, multi-writer backend behind the execution
//! logger. Writes only arrive through [`AuditStore::commit`], one
//! [`AuditTx`] at a time; readers never observe half of a transaction.

use crate::error::AuditError;
use crate::query::RunQuery;
use crate::records::{InputRef, LlmRun, OutputRef, RunDetail, RunError, RunId};
use crate::tx::{AuditOp, AuditTx, CommitReceipt};
use async_trait::async_trait;
use docflow_content::{ContentHash, ContentRecord, ContentStore, MemoryContentStore};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Durable storage for runs, reference rows and content
#[async_trait]
pub trait AuditStore: Send + Sync + std::fmt::Debug {
    /// Apply every operation of `tx` atomically
    ///
    /// # Errors
    /// Any invalid operation (unknown run, completing a completed run,
    /// reference to content that was never staged) rejects the whole
    /// transaction and nothing is written.
    async fn commit(&self, tx: AuditTx) -> Result<CommitReceipt, AuditError>;

    /// Fetch one run
    async fn get_run(&self, run_id: RunId) -> Result<LlmRun, AuditError>;

    /// Runs matching `query`, ordered by `started_at`
    async fn list_runs(&self, query: &RunQuery) -> Result<Vec<LlmRun>, AuditError>;

    /// Input reference rows of a run, ordered by ordinal
    async fn input_refs(&self, run_id: RunId) -> Result<Vec<InputRef>, AuditError>;

    /// Output reference rows of a run, ordered by ordinal
    async fn output_refs(&self, run_id: RunId) -> Result<Vec<OutputRef>, AuditError>;

    /// Error rows of a run, ordered by sequence
    async fn run_errors(&self, run_id: RunId) -> Result<Vec<RunError>, AuditError>;

    /// The content store holding every referenced blob
    fn content(&self) -> Arc<dyn ContentStore>;

    /// Run plus all of its rows
    async fn run_detail(&self, run_id: RunId) -> Result<RunDetail, AuditError> {
        Ok(RunDetail {
            run: self.get_run(run_id).await?,
            inputs: self.input_refs(run_id).await?,
            outputs: self.output_refs(run_id).await?,
            errors: self.run_errors(run_id).await?,
        })
    }
}

#[derive(Debug, Default)]
struct AuditState {
    runs: BTreeMap<RunId, LlmRun>,
    input_refs: Vec<InputRef>,
    output_refs: Vec<OutputRef>,
    errors: Vec<RunError>,
}

/// Rows of a [`MemoryAuditStore`], or of one committed transaction
///
/// A full export has every row; a journal line holds only what one commit
/// added, with touched runs in their committed form.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AuditSnapshot {
    /// Run rows
    pub runs: Vec<LlmRun>,
    /// Input reference rows
    pub input_refs: Vec<InputRef>,
    /// Output reference rows
    pub output_refs: Vec<OutputRef>,
    /// Error rows
    pub errors: Vec<RunError>,
    /// Content records
    pub content: Vec<ContentRecord>,
}

/// Validated changes of one transaction, not yet applied
#[derive(Debug, Default)]
struct PendingCommit {
    runs: HashMap<RunId, LlmRun>,
    input_refs: Vec<InputRef>,
    output_refs: Vec<OutputRef>,
    errors: Vec<RunError>,
    content: Vec<ContentRecord>,
    receipt: CommitReceipt,
}

impl PendingCommit {
    /// Journal line for this commit; content already stored is left out
    fn journal_line(&self, stored: &MemoryContentStore) -> Result<String, AuditError> {
        let entry = AuditSnapshot {
            runs: self.runs.values().cloned().collect(),
            input_refs: self.input_refs.clone(),
            output_refs: self.output_refs.clone(),
            errors: self.errors.clone(),
            content: self
                .content
                .iter()
                .filter(|r| stored.lookup(&r.content_hash).is_none())
                .cloned()
                .collect(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        Ok(line)
    }
}

/// Append-only JSON-lines file, one line per committed transaction
#[derive(Debug)]
struct Journal {
    path: PathBuf,
    /// Keeps journal order equal to commit order
    order: tokio::sync::Mutex<()>,
}

impl Journal {
    async fn append(&self, line: &str) -> Result<(), AuditError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }
}

/// In-memory audit store with optional journal persistence
///
/// When opened with a path, every commit appends one line to the journal
/// before the commit becomes visible. Readers are never blocked by the
/// file write.
#[derive(Debug, Clone)]
pub struct MemoryAuditStore {
    state: Arc<RwLock<AuditState>>,
    content: MemoryContentStore,
    journal: Option<Arc<Journal>>,
}

impl Default for MemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAuditStore {
    /// Volatile store
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(AuditState::default())),
            content: MemoryContentStore::new(),
            journal: None,
        }
    }

    /// Store persisted in the journal at `path`, replaying it if present
    ///
    /// A torn last line, left by a crash during an append, is dropped and
    /// the file is cut back to the last whole commit.
    ///
    /// # Errors
    /// I/O failures, undecodable lines before the last one, or corrupted
    /// content.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        let store = Self::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let mut kept = 0;
            let mut commits = 0;
            let mut lines = raw.split_inclusive('\n').peekable();
            while let Some(line) = lines.next() {
                if line.trim().is_empty() {
                    kept += line.len();
                    continue;
                }
                match serde_json::from_str::<AuditSnapshot>(line) {
                    Ok(entry) => {
                        store.absorb(entry)?;
                        kept += line.len();
                        commits += 1;
                    }
                    Err(err) if lines.peek().is_none() => {
                        tracing::warn!(path = %path.display(), error = %err, "dropping torn journal tail");
                        std::fs::write(&path, &raw[..kept])?;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            tracing::debug!(path = %path.display(), commits, runs = store.run_count(), "audit journal replayed");
        } else if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            journal: Some(Arc::new(Journal {
                path,
                order: tokio::sync::Mutex::new(()),
            })),
            ..store
        })
    }

    /// Rebuild a volatile store from a full export
    ///
    /// # Errors
    /// `AuditError::ContentMismatch` when a content record fails hash
    /// verification.
    pub fn from_snapshot(snapshot: AuditSnapshot) -> Result<Self, AuditError> {
        let store = Self::new();
        store.absorb(snapshot)?;
        Ok(store)
    }

    /// Export the full store
    #[must_use]
    pub fn snapshot(&self) -> AuditSnapshot {
        let state = self.state.read();
        AuditSnapshot {
            runs: state.runs.values().cloned().collect(),
            input_refs: state.input_refs.clone(),
            output_refs: state.output_refs.clone(),
            errors: state.errors.clone(),
            content: self.content.records(),
        }
    }

    /// Number of stored runs
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.state.read().runs.len()
    }

    /// Total reference rows (inputs and outputs) across all runs
    #[must_use]
    pub fn ref_count(&self) -> usize {
        let state = self.state.read();
        state.input_refs.len() + state.output_refs.len()
    }

    /// Merge exported rows; runs replace earlier versions of themselves
    fn absorb(&self, rows: AuditSnapshot) -> Result<(), AuditError> {
        for record in &rows.content {
            if !record.verify() {
                return Err(AuditError::ContentMismatch {
                    hash: record.content_hash,
                });
            }
        }
        for record in &rows.content {
            self.content.insert(&record.content_text);
        }
        let mut state = self.state.write();
        state.runs.extend(rows.runs.into_iter().map(|run| (run.id, run)));
        state.input_refs.extend(rows.input_refs);
        state.output_refs.extend(rows.output_refs);
        state.errors.extend(rows.errors);
        Ok(())
    }

    fn prepare(&self, state: &AuditState, ops: Vec<AuditOp>) -> Result<PendingCommit, AuditError> {
        let mut pending = PendingCommit::default();
        let mut staged: HashSet<ContentHash> = HashSet::new();

        for op in ops {
            match op {
                AuditOp::InsertRun(run) => {
                    if state.runs.contains_key(&run.id) || pending.runs.contains_key(&run.id) {
                        return Err(AuditError::DuplicateRun { run_id: run.id });
                    }
                    pending.receipt.runs_inserted += 1;
                    pending.runs.insert(run.id, run);
                }
                AuditOp::StageContent(record) => {
                    if !record.verify() {
                        return Err(AuditError::ContentMismatch {
                            hash: record.content_hash,
                        });
                    }
                    if staged.insert(record.content_hash) {
                        pending.content.push(record);
                    }
                }
                AuditOp::InputRef(input) => {
                    Self::working_run(state, &mut pending, input.run_id)?;
                    self.ensure_content(&staged, input.content_hash)?;
                    pending.receipt.refs_written += 1;
                    pending.input_refs.push(input);
                }
                AuditOp::OutputRef(output) => {
                    Self::working_run(state, &mut pending, output.run_id)?;
                    self.ensure_content(&staged, output.content_hash)?;
                    pending.receipt.refs_written += 1;
                    pending.output_refs.push(output);
                }
                AuditOp::CompleteRun {
                    run_id,
                    usage,
                    status,
                    completed_at,
                } => {
                    let run = Self::working_run(state, &mut pending, run_id)?;
                    if run.status.is_terminal() {
                        return Err(AuditError::RunAlreadyCompleted { run_id });
                    }
                    run.status = status;
                    run.completed_at = Some(completed_at);
                    if let Some(usage) = usage {
                        run.input_tokens = Some(usage.input_tokens);
                        run.output_tokens = Some(usage.output_tokens);
                    }
                    pending.receipt.runs_completed += 1;
                }
                AuditOp::RecordError {
                    run_id,
                    code,
                    message,
                    occurred_at,
                } => {
                    let run = Self::working_run(state, &mut pending, run_id)?;
                    run.error_count += 1;
                    if run.primary_error_code.is_none() {
                        run.primary_error_code = Some(code.clone());
                        run.primary_error_message = Some(message.clone());
                    }
                    let sequence = run.error_count;
                    pending.errors.push(RunError {
                        run_id,
                        sequence,
                        code,
                        message,
                        occurred_at,
                    });
                    pending.receipt.errors_recorded += 1;
                }
            }
        }

        for record in &pending.content {
            if self.content.lookup(&record.content_hash).is_some() {
                pending.receipt.content_deduplicated += 1;
            }
        }
        Ok(pending)
    }

    fn working_run<'p>(
        state: &AuditState,
        pending: &'p mut PendingCommit,
        run_id: RunId,
    ) -> Result<&'p mut LlmRun, AuditError> {
        if !pending.runs.contains_key(&run_id) {
            let existing = state
                .runs
                .get(&run_id)
                .ok_or(AuditError::RunNotFound { run_id })?;
            pending.runs.insert(run_id, existing.clone());
        }
        pending
            .runs
            .get_mut(&run_id)
            .ok_or(AuditError::RunNotFound { run_id })
    }

    fn ensure_content(&self, staged: &HashSet<ContentHash>, hash: ContentHash) -> Result<(), AuditError> {
        if staged.contains(&hash) || self.content.lookup(&hash).is_some() {
            Ok(())
        } else {
            Err(AuditError::MissingContent { hash })
        }
    }

    fn apply(&self, state: &mut AuditState, mut pending: PendingCommit) -> CommitReceipt {
        for record in pending.content.drain(..) {
            if self.content.insert(&record.content_text).inserted {
                pending.receipt.content_inserted += 1;
            }
        }
        state.runs.extend(pending.runs.drain());
        state.input_refs.append(&mut pending.input_refs);
        state.output_refs.append(&mut pending.output_refs);
        state.errors.append(&mut pending.errors);
        pending.receipt
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn commit(&self, tx: AuditTx) -> Result<CommitReceipt, AuditError> {
        let tx_id = tx.id();
        let receipt = match &self.journal {
            None => {
                let mut state = self.state.write();
                let pending = self.prepare(&state, tx.into_ops())?;
                self.apply(&mut state, pending)
            }
            Some(journal) => {
                // Committers are serialised here, so the state checked by
                // `prepare` is still current when the commit is applied.
                let _order = journal.order.lock().await;
                let (pending, line) = {
                    let state = self.state.read();
                    let pending = self.prepare(&state, tx.into_ops())?;
                    let line = pending.journal_line(&self.content)?;
                    (pending, line)
                };
                journal.append(&line).await?;
                let mut state = self.state.write();
                self.apply(&mut state, pending)
            }
        };

        tracing::debug!(
            tx = %tx_id,
            runs_inserted = receipt.runs_inserted,
            refs = receipt.refs_written,
            content_inserted = receipt.content_inserted,
            "audit transaction committed"
        );
        Ok(receipt)
    }

    async fn get_run(&self, run_id: RunId) -> Result<LlmRun, AuditError> {
        self.state
            .read()
            .runs
            .get(&run_id)
            .cloned()
            .ok_or(AuditError::RunNotFound { run_id })
    }

    async fn list_runs(&self, query: &RunQuery) -> Result<Vec<LlmRun>, AuditError> {
        let state = self.state.read();
        let mut runs: Vec<LlmRun> = state
            .runs
            .values()
            .filter(|run| query.matches(run))
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = query.limit {
            runs.truncate(limit);
        }
        Ok(runs)
    }

    async fn input_refs(&self, run_id: RunId) -> Result<Vec<InputRef>, AuditError> {
        let state = self.state.read();
        if !state.runs.contains_key(&run_id) {
            return Err(AuditError::RunNotFound { run_id });
        }
        let mut refs: Vec<InputRef> = state
            .input_refs
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect();
        refs.sort_by_key(|r| r.ordinal);
        Ok(refs)
    }

    async fn output_refs(&self, run_id: RunId) -> Result<Vec<OutputRef>, AuditError> {
        let state = self.state.read();
        if !state.runs.contains_key(&run_id) {
            return Err(AuditError::RunNotFound { run_id });
        }
        let mut refs: Vec<OutputRef> = state
            .output_refs
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect();
        refs.sort_by_key(|r| r.ordinal);
        Ok(refs)
    }

    async fn run_errors(&self, run_id: RunId) -> Result<Vec<RunError>, AuditError> {
        let state = self.state.read();
        if !state.runs.contains_key(&run_id) {
            return Err(AuditError::RunNotFound { run_id });
        }
        let mut errors: Vec<RunError> = state
            .errors
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect();
        errors.sort_by_key(|e| e.sequence);
        Ok(errors)
    }

    fn content(&self) -> Arc<dyn ContentStore> {
        Arc::new(self.content.clone())
    }
}
