//! LLM client trait and the chat-completions provider implementation.
//!
//! The pipeline consumes the LLM as a stateless oracle: every stage call is
//! a single request with a deadline, and callers choose their own fallback
//! when the oracle is unavailable.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{Error, Result};

use super::types::{
    ChatRole, CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse,
    StopReason, TokenUsage,
};

/// LLM client trait for completions and embeddings.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete a prompt.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Create embeddings for texts.
    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse>;

    /// Provider name used in error reporting and metrics labels.
    fn provider(&self) -> &str;
}

/// Configuration for LLM clients.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API key (may be empty for unauthenticated local inference servers)
    pub api_key: String,
    /// Base URL of the inference server
    pub base_url: String,
    /// Default completion model
    pub default_model: Option<String>,
    /// Default embedding model
    pub embed_model: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Max retries on transient failure
    pub max_retries: u32,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            api_key: String::new(),
            base_url: base_url.into(),
            default_model: None,
            embed_model: None,
            timeout_secs: 15,
            max_retries: 2,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = key.into();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_embed_model(mut self, model: impl Into<String>) -> Self {
        self.embed_model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

fn build_http_client(timeout_secs: u64) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_default()
}

/// Client for OpenAI-compatible chat-completion servers (vLLM, llama.cpp,
/// OpenAI itself). The inference runtime behind the URL is interchangeable.
pub struct ChatCompletionsClient {
    config: ClientConfig,
    http: Client,
}

impl ChatCompletionsClient {
    pub fn new(config: ClientConfig) -> Self {
        let http = build_http_client(config.timeout_secs);
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    async fn post_with_retries<B: Serialize>(&self, url: &str, body: &B) -> Result<String> {
        let mut attempt = 0u32;
        loop {
            let mut req = self.http.post(url).header("content-type", "application/json");
            if !self.config.api_key.is_empty() {
                req = req.header("Authorization", format!("Bearer {}", self.config.api_key));
            }

            let outcome = req.json(body).send().await;
            let retryable = match &outcome {
                Ok(resp) => {
                    let status = resp.status();
                    status.as_u16() == 429 || status.is_server_error()
                }
                Err(_) => true,
            };

            match outcome {
                Ok(resp) if !retryable => {
                    let status = resp.status();
                    let text = resp.text().await.map_err(|e| {
                        Error::llm_api(self.provider(), format!("failed to read response: {e}"))
                    })?;
                    if !status.is_success() {
                        if let Ok(err) = serde_json::from_str::<WireError>(&text) {
                            return Err(Error::llm_api(self.provider(), err.error.message));
                        }
                        return Err(Error::llm_api(
                            self.provider(),
                            format!("HTTP {status}: {text}"),
                        ));
                    }
                    return Ok(text);
                }
                Ok(resp) if attempt >= self.config.max_retries => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    return Err(Error::llm_api(
                        self.provider(),
                        format!("HTTP {status} after {attempt} retries: {text}"),
                    ));
                }
                Err(e) if attempt >= self.config.max_retries => {
                    return Err(Error::upstream(
                        "llm",
                        format!("request failed after {attempt} retries: {e}"),
                    ));
                }
                _ => {
                    let backoff = Duration::from_millis(200 * 2u64.pow(attempt));
                    sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

// OpenAI-compatible wire types
#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    model: String,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireError {
    error: WireErrorDetail,
}

#[derive(Debug, Deserialize)]
struct WireErrorDetail {
    message: String,
}

#[derive(Debug, Serialize)]
struct WireEmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WireEmbeddingResponse {
    model: String,
    data: Vec<WireEmbeddingData>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireEmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl LlmClient for ChatCompletionsClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let model = request
            .model
            .or_else(|| self.config.default_model.clone())
            .ok_or_else(|| Error::Config("no completion model configured".to_string()))?;

        let mut messages: Vec<WireMessage> = Vec::new();
        if let Some(system) = &request.system {
            messages.push(WireMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        for m in &request.messages {
            messages.push(WireMessage {
                role: match m.role {
                    ChatRole::User => "user".to_string(),
                    ChatRole::Assistant => "assistant".to_string(),
                    ChatRole::System => "system".to_string(),
                },
                content: m.content.clone(),
            });
        }

        let api_request = WireRequest {
            model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stop: request.stop,
        };

        let url = format!("{}/v1/chat/completions", self.base_url());
        let body = self.post_with_retries(&url, &api_request).await?;

        let api_response: WireResponse = serde_json::from_str(&body)
            .map_err(|e| Error::llm_api(self.provider(), format!("unparseable response: {e}")))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::llm_api(self.provider(), "no choices in response"))?;

        let stop_reason = choice.finish_reason.as_deref().map(|r| match r {
            "length" => StopReason::MaxTokens,
            "stop" => StopReason::EndTurn,
            _ => StopReason::EndTurn,
        });

        let usage = api_response.usage.unwrap_or_default();

        Ok(CompletionResponse {
            content: choice.message.content,
            model: api_response.model,
            stop_reason,
            usage: TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            },
            timestamp: Utc::now(),
        })
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse> {
        let model = request
            .model
            .or_else(|| self.config.embed_model.clone())
            .ok_or_else(|| Error::Config("no embedding model configured".to_string()))?;

        let api_request = WireEmbeddingRequest {
            model,
            input: request.texts,
        };

        let url = format!("{}/v1/embeddings", self.base_url());
        let body = self.post_with_retries(&url, &api_request).await?;

        let api_response: WireEmbeddingResponse = serde_json::from_str(&body)
            .map_err(|e| Error::llm_api(self.provider(), format!("unparseable response: {e}")))?;

        Ok(EmbeddingResponse {
            embeddings: api_response.data.into_iter().map(|d| d.embedding).collect(),
            model: api_response.model,
            input_tokens: api_response.usage.unwrap_or_default().prompt_tokens,
        })
    }

    fn provider(&self) -> &str {
        "chat-completions"
    }
}
