use async_trait::async_trait;
use docflow_audit::{ModelClient, ModelError, ModelRequest, ModelResponse, TokenUsage};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Replies from a queue, then a fallback; records every request
#[derive(Debug, Default)]
pub struct ScriptedModelClient {
    replies: Mutex<VecDeque<Result<ModelResponse, ModelError>>>,
    fallback: Option<ModelResponse>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModelClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `text` once the queue is empty
    pub fn with_fallback(mut self, text: &str) -> Self {
        self.fallback = Some(response(text, TokenUsage::new(100, 50)));
        self
    }

    pub fn push_text(&self, text: &str) -> &Self {
        self.push_response(text, TokenUsage::new(100, 50))
    }

    pub fn push_response(&self, text: &str, usage: TokenUsage) -> &Self {
        self.replies.lock().push_back(Ok(response(text, usage)));
        self
    }

    pub fn push_error(&self, error: ModelError) -> &Self {
        self.replies.lock().push_back(Err(error));
        self
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        self.requests.lock().push(request.clone());
        if let Some(reply) = self.replies.lock().pop_front() {
            return reply;
        }
        self.fallback.clone().ok_or_else(|| ModelError::Provider {
            code: "script_exhausted".into(),
            message: "no scripted reply left".into(),
        })
    }
}

type Responder = dyn Fn(&ModelRequest) -> Result<ModelResponse, ModelError> + Send + Sync;

/// Replies computed from the request; records every request
#[derive(Clone)]
pub struct FnModelClient {
    respond: Arc<Responder>,
    requests: Arc<Mutex<Vec<ModelRequest>>>,
}

impl FnModelClient {
    pub fn new(respond: impl Fn(&ModelRequest) -> Result<ModelResponse, ModelError> + Send + Sync + 'static) -> Self {
        Self {
            respond: Arc::new(respond),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Reply with `text(request)` and fixed token usage
    pub fn text(text: impl Fn(&ModelRequest) -> String + Send + Sync + 'static) -> Self {
        Self::new(move |request| Ok(response(&text(request), TokenUsage::new(100, 50))))
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl fmt::Debug for FnModelClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnModelClient")
            .field("calls", &self.call_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ModelClient for FnModelClient {
    async fn invoke(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        self.requests.lock().push(request.clone());
        (self.respond)(request)
    }
}

/// Sleeps before replying
#[derive(Debug)]
pub struct SlowModelClient {
    delay: Duration,
    text: String,
    started: Mutex<usize>,
}

impl SlowModelClient {
    pub fn new(delay: Duration, text: &str) -> Self {
        Self {
            delay,
            text: text.to_string(),
            started: Mutex::new(0),
        }
    }

    /// Calls that began, whether or not they finished
    pub fn started(&self) -> usize {
        *self.started.lock()
    }
}

#[async_trait]
impl ModelClient for SlowModelClient {
    async fn invoke(&self, _request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        *self.started.lock() += 1;
        tokio::time::sleep(self.delay).await;
        Ok(response(&self.text, TokenUsage::new(10, 10)))
    }
}

fn response(text: &str, usage: TokenUsage) -> ModelResponse {
    ModelResponse {
        text: text.to_string(),
        usage,
    }
}
