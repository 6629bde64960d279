//! OpenAI-compatible generation backend.
//!
//! Works with any `/chat/completions` endpoint: OpenAI, OpenRouter, vLLM,
//! LM Studio, or Ollama in compatibility mode.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use undertow_core::{Error, GenerationBackend, GenerationRequest, GenerationResponse, Result};

/// Default OpenAI API endpoint.
pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";

/// Default generation model.
pub const DEFAULT_GEN_MODEL: &str = "gpt-4o-mini";

/// Default timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Configuration for an OpenAI-compatible backend.
#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    pub base_url: String,
    /// Optional for local endpoints.
    pub api_key: Option<String>,
    pub gen_model: String,
    pub timeout_seconds: u64,
    /// HTTP-Referer header for OpenRouter rankings.
    pub http_referer: Option<String>,
    /// X-Title header for OpenRouter.
    pub x_title: Option<String>,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OPENAI_URL.to_string(),
            api_key: None,
            gen_model: DEFAULT_GEN_MODEL.to_string(),
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            http_referer: None,
            x_title: None,
        }
    }
}

impl OpenAIConfig {
    /// Read `OPENAI_BASE_URL`, `OPENAI_API_KEY`, `OPENAI_GEN_MODEL`,
    /// `OPENAI_TIMEOUT`, `OPENAI_HTTP_REFERER`, `OPENAI_X_TITLE`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("OPENAI_BASE_URL").unwrap_or(defaults.base_url),
            api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            gen_model: std::env::var("OPENAI_GEN_MODEL").unwrap_or(defaults.gen_model),
            timeout_seconds: std::env::var("OPENAI_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.timeout_seconds),
            http_referer: std::env::var("OPENAI_HTTP_REFERER").ok(),
            x_title: std::env::var("OPENAI_X_TITLE").ok(),
        }
    }

    pub fn with_gen_model(mut self, model: impl Into<String>) -> Self {
        self.gen_model = model.into();
        self
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorResponse {
    error: OpenAIError,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    message: String,
}

/// Map an unsuccessful HTTP status to an error kind.
fn status_error(status: u16, message: &str) -> Error {
    match status {
        401 | 403 => Error::Config(format!("Authentication failed: {}", message)),
        404 => Error::Config(format!("Model not found: {}", message)),
        429 => Error::Inference(format!("Rate limit exceeded: {}", message)),
        _ => Error::Inference(format!("OpenAI returned {}: {}", status, message)),
    }
}

/// OpenAI-compatible backend.
pub struct OpenAIBackend {
    client: Client,
    config: OpenAIConfig,
}

impl OpenAIBackend {
    pub fn new(config: OpenAIConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| Error::Inference(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            subsystem = "inference",
            component = "openai",
            url = %config.base_url,
            model = %config.gen_model,
            "Initializing OpenAI-compatible backend"
        );

        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(OpenAIConfig::from_env())
    }

    pub fn config(&self) -> &OpenAIConfig {
        &self.config
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    fn authorize(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ref api_key) = self.config.api_key {
            req = req.bearer_auth(api_key);
        }
        if let Some(ref referer) = self.config.http_referer {
            req = req.header("HTTP-Referer", referer);
        }
        if let Some(ref title) = self.config.x_title {
            req = req.header("X-Title", title);
        }
        req
    }
}

#[async_trait]
impl GenerationBackend for OpenAIBackend {
    #[instrument(skip(self, request), fields(subsystem = "inference", component = "openai", op = "invoke", model = %self.config.gen_model))]
    async fn invoke(&self, request: GenerationRequest) -> Result<GenerationResponse> {
        let mut messages = Vec::with_capacity(2);
        if !request.system_prompt.is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: request.system_prompt,
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.user_prompt,
        });

        let body = ChatCompletionRequest {
            model: self.config.gen_model.clone(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request
                .json
                .then(|| serde_json::json!({"type": "json_object"})),
            stream: false,
        };

        let response = self
            .authorize(self.client.post(self.url("/chat/completions")))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Inference(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .json::<OpenAIErrorResponse>()
                .await
                .map(|e| e.error.message)
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(status_error(status, &message));
        }

        let result: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::Inference(format!("Failed to parse response: {}", e)))?;

        let text = result
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        debug!(response_len = text.len(), "Generation complete");
        Ok(GenerationResponse { text })
    }

    fn model_name(&self) -> &str {
        &self.config.gen_model
    }

    async fn health_check(&self) -> Result<bool> {
        let response = self
            .authorize(self.client.get(self.url("/models")))
            .timeout(Duration::from_secs(5))
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => Ok(true),
            Ok(resp) => {
                warn!(status = %resp.status(), "OpenAI health check failed");
                Ok(false)
            }
            Err(e) => {
                warn!(error = %e, "OpenAI health check error");
                Ok(false)
            }
        }
    }
}
