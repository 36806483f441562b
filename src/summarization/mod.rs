//! Abstractions for turning text into summaries via an LLM provider.
//!
//! The pipeline only sees [`SummarizationService`]; the Ollama-backed client issues HTTP
//! requests directly to the runtime and classifies failures so the caller can decide what to
//! retry.

use crate::config::Config;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Placeholder substituted with the document text when present in an instruction.
pub const TEXT_PLACEHOLDER: &str = "{text}";

/// Errors surfaced by a summarization provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// Temporary failure (network, timeout, overload); eligible for retry.
    #[error("Summarization service temporarily unavailable: {0}")]
    Transient(String),
    /// Provider quota or rate limit exhausted.
    #[error("Summarization quota exceeded: {0}")]
    Quota(String),
    /// Provider rejected the request outright.
    #[error("Summarization request rejected: {0}")]
    Invalid(String),
}

impl ServiceError {
    /// Whether the retry policy may attempt the call again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Interface implemented by summarization providers.
#[async_trait]
pub trait SummarizationService: Send + Sync {
    /// Summarize `text` following `instruction`.
    async fn complete(&self, text: &str, instruction: &str) -> Result<String, ServiceError>;
}

/// Combine an instruction and the text it applies to into a single prompt.
///
/// Instructions containing `{text}` get the text substituted in place; any other instruction
/// has the text appended after it.
pub fn render_prompt(instruction: &str, text: &str) -> String {
    let instruction = instruction.trim();
    if instruction.contains(TEXT_PLACEHOLDER) {
        instruction.replace(TEXT_PLACEHOLDER, text)
    } else {
        format!("{instruction}\n\nText:\n{text}")
    }
}

/// Summarization client backed by a local Ollama runtime.
pub struct OllamaSummarizationClient {
    http: Client,
    base_url: String,
    model: String,
    temperature: f32,
}

impl OllamaSummarizationClient {
    /// Build a client for the runtime and model named in `config`.
    pub fn from_config(config: &Config) -> Result<Self, ServiceError> {
        let http = Client::builder()
            .user_agent("pdf-summarizer/summary")
            .timeout(config.call_timeout() + Duration::from_secs(5))
            .build()
            .map_err(|error| ServiceError::Invalid(format!("failed to build HTTP client: {error}")))?;
        Ok(Self {
            http,
            base_url: config.ollama_url.clone(),
            model: config.summarization_model.clone(),
            temperature: config.summarization_temperature,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
    done: bool,
}

fn classify_status(status: StatusCode, body: String) -> ServiceError {
    let message = format!("Ollama returned {status}: {body}");
    match status {
        StatusCode::TOO_MANY_REQUESTS => ServiceError::Quota(message),
        status if status.is_server_error() => ServiceError::Transient(message),
        StatusCode::REQUEST_TIMEOUT => ServiceError::Transient(message),
        _ => ServiceError::Invalid(message),
    }
}

#[async_trait]
impl SummarizationService for OllamaSummarizationClient {
    async fn complete(&self, text: &str, instruction: &str) -> Result<String, ServiceError> {
        let payload = json!({
            "model": self.model,
            "prompt": render_prompt(instruction, text),
            "stream": false,
            "options": {
                "temperature": self.temperature,
            }
        });

        let response = self
            .http
            .post(self.endpoint())
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                ServiceError::Transient(format!(
                    "failed to reach Ollama at {}: {error}",
                    self.base_url
                ))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let body: OllamaResponse = response.json().await.map_err(|error| {
            ServiceError::Transient(format!("failed to decode Ollama response: {error}"))
        })?;

        if !body.done {
            return Err(ServiceError::Invalid(
                "Ollama response incomplete (streaming not supported)".into(),
            ));
        }

        let summary = body.response.trim();
        if summary.is_empty() {
            return Err(ServiceError::Transient("Ollama returned an empty summary".into()));
        }
        Ok(summary.to_string())
    }
}
