//! OpenAI-compatible chat completions provider.
//!
//! Works against OpenAI itself and anything speaking the same protocol:
//! Azure OpenAI behind a compatible gateway, Ollama, vLLM, LM Studio.

use crate::brain::{CompletionRequest, CompletionResponse, LlmProvider, Message, TokenUsage};
use crate::config::LlmConfig;
use crate::error::LlmError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Fallback wait when a 429 does not say how long to back off.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

pub struct OpenAiCompatibleProvider {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
}

impl OpenAiCompatibleProvider {
    /// Build from config.
    ///
    /// The key comes from `api_key`, then the `api_key_env` variable. Endpoints
    /// on localhost may run without one.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = match resolve_api_key(config) {
            Some(key) => key,
            None if is_local(config.base_url.as_deref()) => {
                debug!("No API key for local endpoint, sending placeholder token");
                "local".to_string()
            }
            None => {
                return Err(LlmError::AuthFailed {
                    provider: format!(
                        "{} (set {} or llm.api_key)",
                        config.provider, config.api_key_env
                    ),
                });
            }
        };
        Self::with_key(config, api_key)
    }

    pub fn with_key(config: &LlmConfig, api_key: String) -> Result<Self, LlmError> {
        let base = config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Connection {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            timeout_secs: config.timeout_secs,
        })
    }

    fn chat_request<'a>(&'a self, request: &'a CompletionRequest) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature,
            stream: false,
            max_tokens: request.max_tokens,
            response_format: request.json_output.then_some(ResponseFormat {
                kind: "json_object",
            }),
        }
    }

    fn completion_from(&self, body: ChatResponse) -> Result<CompletionResponse, LlmError> {
        let Some(choice) = body.choices.into_iter().next() else {
            return Err(LlmError::ResponseParse {
                message: "response has no choices".to_string(),
            });
        };
        let usage = body
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            text: choice.message.content.unwrap_or_default(),
            model: body.model.unwrap_or_else(|| self.model.clone()),
            usage,
            finish_reason: choice.finish_reason,
        })
    }

    fn transport_error(&self, e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout {
                timeout_secs: self.timeout_secs,
            }
        } else if e.is_connect() {
            LlmError::Connection {
                message: e.to_string(),
            }
        } else {
            LlmError::ApiRequest {
                message: format!("Request failed: {}", e),
            }
        }
    }
}

fn resolve_api_key(config: &LlmConfig) -> Option<String> {
    config
        .api_key
        .clone()
        .or_else(|| std::env::var(&config.api_key_env).ok())
        .filter(|key| !key.trim().is_empty())
}

fn is_local(base_url: Option<&str>) -> bool {
    base_url.is_some_and(|u| u.contains("localhost") || u.contains("127.0.0.1"))
}

/// Pull the wait out of "... Please try again in 7s." style messages.
fn retry_after_secs(body: &str) -> Option<u64> {
    let envelope: ErrorEnvelope = serde_json::from_str(body).ok()?;
    let tail = envelope.error.message.rsplit("in ").next()?;
    tail.trim_end_matches('.').trim_end_matches('s').parse().ok()
}

fn status_error(status: StatusCode, body: &str) -> LlmError {
    match status.as_u16() {
        401 | 403 => {
            debug!(%status, body, "Provider rejected credentials");
            LlmError::AuthFailed {
                provider: "openai-compatible".to_string(),
            }
        }
        429 => LlmError::RateLimited {
            retry_after_secs: retry_after_secs(body).unwrap_or(DEFAULT_RETRY_AFTER_SECS),
        },
        408 | 504 => LlmError::Timeout { timeout_secs: 0 },
        code => LlmError::ApiRequest {
            message: format!("HTTP {}: {}", code, body),
        },
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        debug!(endpoint = %self.endpoint, model = %self.model, "Sending completion request");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.chat_request(&request))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| self.transport_error(e))?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }

        let body: ChatResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::ResponseParse {
                message: format!("Invalid completion body: {}", e),
            })?;
        self.completion_from(body)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
