//! Model invocation port
//!
//! The model service is a black box with no memory of prior calls: every
//! request carries its complete system and user prompt.

use crate::records::TokenUsage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

/// A complete, stateless model request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    /// Role prompt
    pub system_prompt: String,
    /// Rendered task input
    pub user_prompt: String,
    /// Model identifier
    pub model: String,
    /// Provider parameters, passed through untouched
    pub params: serde_json::Value,
}

/// Model output and provider-reported usage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Raw model output
    pub text: String,
    /// Provider-reported token counts
    pub usage: TokenUsage,
}

/// Model invocation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// Provider rejected or failed the call
    #[error("provider error {code}: {message}")]
    Provider { code: String, message: String },

    /// No response within the deadline
    #[error("model call timed out after {after_secs}s")]
    Timeout { after_secs: u64 },

    /// Abandoned by the caller
    #[error("model call cancelled")]
    Cancelled,
}

impl ModelError {
    /// Short code recorded as the run's error code
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Provider { code, .. } => code,
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Model Invocation Service
#[async_trait]
pub trait ModelClient: Send + Sync + std::fmt::Debug {
    /// Perform one stateless call
    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError>;
}

/// Cancels in-flight model calls observing the paired [`CancelToken`]
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    /// Signal every paired token
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Observed by executors; cloning shares the same signal
#[derive(Debug, Clone)]
pub struct CancelToken(watch::Receiver<bool>);

impl CancelToken {
    /// Whether cancellation was signalled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                // Handle dropped without cancelling: never fires.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a linked cancel handle and token
#[must_use]
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelToken(rx))
}

/// Invoke with a deadline, abandoning the call if `cancel` fires first
///
/// # Errors
/// `ModelError::Timeout` when `timeout` elapses, `ModelError::Cancelled` when
/// the token fires, or the client's own error.
pub async fn invoke_bounded(
    client: &dyn ModelClient,
    request: &ModelRequest,
    timeout: Duration,
    cancel: Option<&CancelToken>,
) -> Result<ModelResponse, ModelError> {
    let deadline = tokio::time::timeout(timeout, client.invoke(request));
    let timed_out = || ModelError::Timeout {
        after_secs: timeout.as_secs(),
    };

    match cancel {
        None => deadline.await.map_err(|_| timed_out())?,
        Some(token) => {
            if token.is_cancelled() {
                return Err(ModelError::Cancelled);
            }
            let mut token = token.clone();
            tokio::select! {
                result = deadline => result.map_err(|_| timed_out())?,
                () = token.cancelled() => Err(ModelError::Cancelled),
            }
        }
    }
}
