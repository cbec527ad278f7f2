//! Audit read API
//!
//! Thin facade over an [`AuditStore`] for operators and tooling: list runs,
//! inspect one, rebuild its inputs, replay it.

use crate::error::{AuditError, ReplayError};
use crate::model::ModelClient;
use crate::query::RunQuery;
use crate::records::{LlmRun, RunDetail, RunId};
use crate::replay::{ReconstructedInputs, ReplayEngine, ReplayOutcome};
use crate::store::AuditStore;
use std::sync::Arc;
use std::time::Duration;

/// Read and replay access to the audit log
#[derive(Debug, Clone)]
pub struct AuditService {
    store: Arc<dyn AuditStore>,
    replay: Option<ReplayEngine>,
}

impl AuditService {
    /// Read-only service; [`replay`](Self::replay) is unavailable
    #[must_use]
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self {
            store,
            replay: None,
        }
    }

    /// Service that can also re-execute runs against `model`
    #[must_use]
    pub fn with_model(store: Arc<dyn AuditStore>, model: Arc<dyn ModelClient>, timeout: Duration) -> Self {
        let replay = ReplayEngine::new(store.clone(), model).with_timeout(timeout);
        Self {
            store,
            replay: Some(replay),
        }
    }

    /// Underlying store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }

    /// Runs matching `query`, oldest first
    ///
    /// # Errors
    /// Store failures.
    pub async fn list_runs(&self, query: &RunQuery) -> Result<Vec<LlmRun>, AuditError> {
        self.store.list_runs(query).await
    }

    /// Run with its inputs, outputs and errors
    ///
    /// # Errors
    /// `RunNotFound` for an unknown run.
    pub async fn run_detail(&self, run_id: RunId) -> Result<RunDetail, AuditError> {
        self.store.run_detail(run_id).await
    }

    /// Inputs of a run, verified and in original order
    ///
    /// # Errors
    /// See [`ReplayEngine::reconstruct_inputs`].
    pub async fn reconstruct_inputs(&self, run_id: RunId) -> Result<ReconstructedInputs, ReplayError> {
        match &self.replay {
            Some(engine) => engine.reconstruct_inputs(run_id).await,
            None => {
                // Reconstruction never touches the model.
                ReplayEngine::new(self.store.clone(), Arc::new(NoModel))
                    .reconstruct_inputs(run_id)
                    .await
            }
        }
    }

    /// Re-execute a run
    ///
    /// # Errors
    /// `Model` with a `not_configured` provider code when the service was
    /// built without a model; otherwise see [`ReplayEngine::replay`].
    pub async fn replay(&self, run_id: RunId) -> Result<ReplayOutcome, ReplayError> {
        match &self.replay {
            Some(engine) => engine.replay(run_id).await,
            None => ReplayEngine::new(self.store.clone(), Arc::new(NoModel)).replay(run_id).await,
        }
    }
}

#[derive(Debug)]
struct NoModel;

#[async_trait::async_trait]
impl ModelClient for NoModel {
    async fn invoke(
        &self,
        _request: &crate::model::ModelRequest,
    ) -> Result<crate::model::ModelResponse, crate::model::ModelError> {
        Err(crate::model::ModelError::Provider {
            code: "not_configured".into(),
            message: "audit service has no model client".into(),
        })
    }
}
