//! Run filters for the audit read API

use crate::records::{CorrelationId, LlmRun};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Filter over stored runs; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunQuery {
    /// Only runs of this correlation id
    pub correlation_id: Option<CorrelationId>,
    /// Only runs producing this document type
    pub artifact_type: Option<String>,
    /// Inclusive lower bound on `started_at`
    pub started_from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `started_at`
    pub started_before: Option<DateTime<Utc>>,
    /// `Some(true)` for replays only, `Some(false)` to exclude them
    pub replays: Option<bool>,
    /// Maximum number of runs returned
    pub limit: Option<usize>,
}

impl RunQuery {
    /// Query matching every run
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by correlation id
    #[must_use]
    pub fn correlation(mut self, id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Filter by artifact type
    #[must_use]
    pub fn artifact_type(mut self, artifact_type: impl Into<String>) -> Self {
        self.artifact_type = Some(artifact_type.into());
        self
    }

    /// Runs started in `[from, before)`
    #[must_use]
    pub fn between(mut self, from: DateTime<Utc>, before: DateTime<Utc>) -> Self {
        self.started_from = Some(from);
        self.started_before = Some(before);
        self
    }

    /// Filter on replay flag
    #[must_use]
    pub fn replays_only(mut self, replays: bool) -> Self {
        self.replays = Some(replays);
        self
    }

    /// Cap the result size
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `run` passes every set filter
    #[must_use]
    pub fn matches(&self, run: &LlmRun) -> bool {
        self.correlation_id
            .as_ref()
            .map_or(true, |id| &run.correlation_id == id)
            && self
                .artifact_type
                .as_ref()
                .map_or(true, |t| &run.artifact_type == t)
            && self.started_from.map_or(true, |from| run.started_at >= from)
            && self
                .started_before
                .map_or(true, |before| run.started_at < before)
            && self.replays.map_or(true, |r| run.is_replay == r)
    }
}
