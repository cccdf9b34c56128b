//! Language-model contract used by the observer and reflector.

mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{OmError, OmInferenceFailureKind, OmInferenceSource};
use crate::om::OmScope;

pub use http::{HttpLanguageModel, extract_llm_content, parse_model_endpoint, status_failure_kind};

pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub provider: String,
    pub model: String,
    pub max_output_tokens: u32,
    pub temperature_milli: u16,
}

impl ModelSettings {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            max_output_tokens: 4_096,
            temperature_milli: 300,
        }
    }

    #[must_use]
    pub const fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    #[must_use]
    pub const fn with_temperature_milli(mut self, temperature_milli: u16) -> Self {
        self.temperature_milli = temperature_milli;
        self
    }

    #[must_use]
    pub fn temperature(&self) -> f64 {
        f64::from(self.temperature_milli) / 1000.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPrompt {
    pub system: String,
    pub user: String,
}

/// What a cycle is about to do; handed to the [`ModelResolver`] at cycle start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelRequestContext<'a> {
    pub source: OmInferenceSource,
    pub scope: OmScope,
    pub scope_key: &'a str,
    pub generation_count: u32,
    pub input_tokens: u32,
}

pub type ModelResolver = Arc<dyn Fn(&ModelRequestContext<'_>) -> ModelSettings + Send + Sync>;

pub fn fixed_model(settings: ModelSettings) -> ModelResolver {
    Arc::new(move |_: &ModelRequestContext<'_>| settings.clone())
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ModelError {
    pub kind: OmInferenceFailureKind,
    pub message: String,
}

impl ModelError {
    pub fn new(kind: OmInferenceFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(OmInferenceFailureKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(OmInferenceFailureKind::Fatal, message)
    }

    #[must_use]
    pub fn into_om_error(self, source: OmInferenceSource) -> OmError {
        OmError::ModelInvocation {
            inference_source: source,
            kind: self.kind,
            message: self.message,
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(
        &self,
        prompt: &ModelPrompt,
        settings: &ModelSettings,
    ) -> Result<String, ModelError>;
}

/// Runs one generation bounded by `timeout`, attributing failures to `source`.
pub(crate) async fn generate_with_timeout(
    model: &dyn LanguageModel,
    prompt: &ModelPrompt,
    settings: &ModelSettings,
    timeout: Duration,
    source: OmInferenceSource,
) -> crate::error::Result<String> {
    match tokio::time::timeout(timeout, model.generate(prompt, settings)).await {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(err)) => Err(err.into_om_error(source)),
        Err(_) => Err(ModelError::new(
            OmInferenceFailureKind::Timeout,
            format!("no response within {}ms", timeout.as_millis()),
        )
        .into_om_error(source)),
    }
}
