use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;

use super::{LanguageModel, ModelError, ModelPrompt, ModelSettings};
use crate::error::{OmError, OmInferenceFailureKind, Result};

/// Chat-style HTTP adapter for Ollama and OpenAI-compatible endpoints.
#[derive(Debug, Clone)]
pub struct HttpLanguageModel {
    client: Client,
    endpoint: Url,
}

impl HttpLanguageModel {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        Self::build(endpoint, timeout, false)
    }

    /// Same as [`HttpLanguageModel::new`] but refuses anything other than a
    /// loopback host.
    pub fn local(endpoint: &str, timeout: Duration) -> Result<Self> {
        Self::build(endpoint, timeout, true)
    }

    fn build(endpoint: &str, timeout: Duration, loopback_only: bool) -> Result<Self> {
        let endpoint = parse_model_endpoint(endpoint, loopback_only).map_err(OmError::Validation)?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }

    #[must_use]
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    async fn generate(
        &self,
        prompt: &ModelPrompt,
        settings: &ModelSettings,
    ) -> std::result::Result<String, ModelError> {
        let payload = serde_json::json!({
            "model": settings.model,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user}
            ],
            "stream": false,
            "max_tokens": settings.max_output_tokens,
            "temperature": settings.temperature(),
            "options": {
                "temperature": settings.temperature(),
                "num_predict": settings.max_output_tokens
            }
        });
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                let kind = if err.is_timeout() {
                    OmInferenceFailureKind::Timeout
                } else {
                    OmInferenceFailureKind::Transient
                };
                ModelError::new(kind, format!("request failed: {err}"))
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ModelError::new(
                status_failure_kind(status),
                format!("non-success status: {status}"),
            ));
        }
        let value = response.json::<Value>().await.map_err(|err| {
            ModelError::new(
                OmInferenceFailureKind::Schema,
                format!("invalid json response: {err}"),
            )
        })?;
        extract_llm_content(&value).ok_or_else(|| {
            ModelError::new(
                OmInferenceFailureKind::Schema,
                "response carried no message content",
            )
        })
    }
}

pub fn parse_model_endpoint(raw: &str, loopback_only: bool) -> std::result::Result<Url, String> {
    let url = Url::parse(raw.trim()).map_err(|err| format!("invalid model endpoint: {err}"))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(format!("unsupported model endpoint scheme: {other}")),
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err("model endpoint must not include credentials".to_string());
    }
    let host = url
        .host_str()
        .ok_or_else(|| "model endpoint host is missing".to_string())?;
    if loopback_only && !matches!(host, "127.0.0.1" | "localhost" | "::1" | "[::1]") {
        return Err(format!("model endpoint must use a loopback host, got: {host}"));
    }
    Ok(url)
}

/// Server errors and throttling are worth retrying on the next trigger;
/// everything else is a configuration problem.
#[must_use]
pub fn status_failure_kind(status: StatusCode) -> OmInferenceFailureKind {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        OmInferenceFailureKind::Transient
    } else {
        OmInferenceFailureKind::Fatal
    }
}

pub fn extract_llm_content(value: &Value) -> Option<String> {
    let candidates = [
        value.pointer("/message/content"),
        value.pointer("/choices/0/message/content"),
        value.get("response"),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(Value::as_str)
        .map(ToString::to_string)
}
