//! Engine configuration

use crate::context::ContextSchema;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Step and workflow executor settings
///
/// ```toml
/// max_qa_attempts = 3
/// model_timeout_secs = 120
/// default_model = "gpt-4o"
///
/// [model_params]
/// temperature = 0.2
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Model attempts per step before QA remediation is exhausted
    pub max_qa_attempts: u32,
    /// Deadline for one model call
    pub model_timeout_secs: u64,
    /// Model used when a step names none
    pub default_model: String,
    /// Parameters sent with every model call
    pub model_params: serde_json::Value,
    /// Fields allowed in context state
    pub context_schema: ContextSchema,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_qa_attempts: 3,
            model_timeout_secs: 120,
            default_model: "default".to_string(),
            model_params: serde_json::Value::Object(serde_json::Map::new()),
            context_schema: ContextSchema::default(),
        }
    }
}

impl EngineConfig {
    /// Engine defaults
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and check a TOML document
    ///
    /// # Errors
    /// `ConfigError::Parse` on malformed TOML, `ConfigError::Invalid` when a
    /// limit is zero.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// `ConfigError::Io` when the file cannot be read, else as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        tracing::debug!(path = %path.display(), "loading engine config");
        Self::from_toml_str(&text)
    }

    /// Reject zero limits
    ///
    /// # Errors
    /// `ConfigError::Invalid` naming the offending setting.
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.max_qa_attempts == 0 {
            return Err(ConfigError::Invalid("max_qa_attempts must be at least 1".into()));
        }
        if self.model_timeout_secs == 0 {
            return Err(ConfigError::Invalid("model_timeout_secs must be at least 1".into()));
        }
        Ok(())
    }

    /// Set QA attempts per step
    #[inline]
    #[must_use]
    pub fn with_max_qa_attempts(mut self, attempts: u32) -> Self {
        self.max_qa_attempts = attempts;
        self
    }

    /// Set the per-call model deadline
    #[inline]
    #[must_use]
    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Set the fallback model
    #[inline]
    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Set model parameters
    #[inline]
    #[must_use]
    pub fn with_model_params(mut self, params: serde_json::Value) -> Self {
        self.model_params = params;
        self
    }

    /// Set the context schema
    #[inline]
    #[must_use]
    pub fn with_context_schema(mut self, schema: ContextSchema) -> Self {
        self.context_schema = schema;
        self
    }

    /// Per-call model deadline
    #[inline]
    #[must_use]
    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{FieldShape, MergePolicy};

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_qa_attempts, 3);
        assert_eq!(config.model_timeout(), Duration::from_secs(120));
        assert!(config.context_schema.field("open_gaps").is_some());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            max_qa_attempts = 5
            default_model = "gpt-4o"

            [model_params]
            temperature = 0.2

            [context_schema.fields.risks]
            shape = "list"
            merge = "append"
            visible_to = ["architect"]
            "#,
        )
        .unwrap();
        assert_eq!(config.max_qa_attempts, 5);
        assert_eq!(config.model_timeout_secs, 120);
        assert_eq!(config.model_params["temperature"], 0.2);
        let risks = config.context_schema.field("risks").unwrap();
        assert_eq!(risks.shape, FieldShape::List);
        assert_eq!(risks.merge, MergePolicy::Append);
    }

    #[test]
    fn zero_attempts_rejected() {
        let err = EngineConfig::from_toml_str("max_qa_attempts = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
