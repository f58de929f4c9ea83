//! Anthropic Messages API provider.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::errors::{DomainError, DomainResult, StepError};
use crate::domain::models::ProviderConfig;
use crate::domain::ports::{AiProvider, CompletionRequest, CompletionResponse};

const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<Message<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: Usage,
}

/// Provider backed by the Anthropic Messages API.
pub struct AnthropicProvider {
    name: String,
    config: ProviderConfig,
    api_key: Option<String>,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(name: impl Into<String>, config: ProviderConfig) -> DomainResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DomainError::Configuration(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            config,
            api_key: None,
            client,
        })
    }

    /// Use an explicit key instead of reading `api_key_env`.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn api_key(&self) -> Result<String, StepError> {
        match &self.api_key {
            Some(key) => Ok(key.clone()),
            None => std::env::var(&self.config.api_key_env)
                .map_err(|_| StepError::System(format!("{} not set", self.config.api_key_env))),
        }
    }

    fn build_request<'a>(&'a self, request: &'a CompletionRequest) -> MessagesRequest<'a> {
        MessagesRequest {
            model: request.model.as_deref().unwrap_or(&self.config.model),
            max_tokens: request.max_tokens.unwrap_or(self.config.max_tokens),
            system: request.system_prompt.as_deref(),
            messages: vec![Message {
                role: "user",
                content: &request.prompt,
            }],
            temperature: request.temperature,
        }
    }
}

/// Classify a non-success API status. Throttling and server faults are
/// transient; everything else is a permanent execution failure.
fn status_error(status: StatusCode, body: &str) -> StepError {
    let message = format!("API error {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        StepError::network(message)
    } else {
        StepError::execution(message)
    }
}

#[async_trait]
impl AiProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, StepError> {
        let api_key = self.api_key()?;
        let body = self.build_request(request);

        let response = self
            .client
            .post(format!("{}/v1/messages", self.config.base_url.trim_end_matches('/')))
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-api-key", &api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    StepError::network(format!("API request timed out: {e}"))
                } else {
                    StepError::network(format!("API request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let result: MessagesResponse = response
            .json()
            .await
            .map_err(|e| StepError::execution(format!("Failed to parse response: {e}")))?;

        let text = result
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        Ok(CompletionResponse {
            text,
            model: result.model,
            finish_reason: result.stop_reason,
            input_tokens: result.usage.input_tokens,
            output_tokens: result.usage.output_tokens,
        })
    }
}
