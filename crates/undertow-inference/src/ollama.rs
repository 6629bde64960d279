//! Ollama generation backend.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use undertow_core::defaults;
use undertow_core::{Error, GenerationBackend, GenerationRequest, GenerationResponse, Result};

/// Default Ollama endpoint.
pub const DEFAULT_OLLAMA_URL: &str = defaults::OLLAMA_URL;

/// Default generation model.
pub const DEFAULT_GEN_MODEL: &str = defaults::GEN_MODEL;

/// Generations slower than this are logged as slow.
const SLOW_GENERATION_MS: u64 = 30_000;

/// Ollama backend using the `/api/chat` endpoint.
pub struct OllamaBackend {
    client: Client,
    base_url: String,
    gen_model: String,
    gen_timeout_secs: u64,
}

impl OllamaBackend {
    /// Backend with default URL and model.
    pub fn new() -> Self {
        Self::with_config(DEFAULT_OLLAMA_URL.to_string(), DEFAULT_GEN_MODEL.to_string())
    }

    /// Backend for an explicit URL and model.
    ///
    /// The request timeout comes from `UNDERTOW_GEN_TIMEOUT_SECS`.
    pub fn with_config(base_url: String, gen_model: String) -> Self {
        let gen_timeout_secs = std::env::var("UNDERTOW_GEN_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::GEN_TIMEOUT_SECS);

        let client = Client::builder()
            .timeout(Duration::from_secs(gen_timeout_secs))
            .build()
            .unwrap_or_default();

        info!(
            subsystem = "inference",
            component = "ollama",
            url = %base_url,
            model = %gen_model,
            timeout_secs = gen_timeout_secs,
            "Initializing Ollama backend"
        );

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            gen_model,
            gen_timeout_secs,
        }
    }

    /// Capable-tier backend from `OLLAMA_BASE` and `OLLAMA_GEN_MODEL`.
    pub fn from_env() -> Self {
        let gen_model =
            std::env::var("OLLAMA_GEN_MODEL").unwrap_or_else(|_| DEFAULT_GEN_MODEL.to_string());
        Self::from_env_with_gen_model(gen_model)
    }

    /// Backend at `OLLAMA_BASE` with an explicit model.
    pub fn from_env_with_gen_model(gen_model: String) -> Self {
        let base_url =
            std::env::var("OLLAMA_BASE").unwrap_or_else(|_| DEFAULT_OLLAMA_URL.to_string());
        Self::with_config(base_url, gen_model)
    }

    /// Low-latency backend for the gate decision.
    ///
    /// Model resolution: `UNDERTOW_FAST_GEN_MODEL` env var, else `granite4:3b`.
    /// Setting it to an empty string disables the fast tier; callers then use
    /// the capable backend for the gate as well.
    /// Timeout: `UNDERTOW_FAST_GEN_TIMEOUT_SECS`, else 30s.
    pub fn fast_from_env() -> Option<Self> {
        let model = match std::env::var("UNDERTOW_FAST_GEN_MODEL") {
            Ok(val) if val.trim().is_empty() => return None,
            Ok(val) => val,
            Err(_) => defaults::FAST_GEN_MODEL.to_string(),
        };

        let timeout = std::env::var("UNDERTOW_FAST_GEN_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::FAST_GEN_TIMEOUT_SECS);

        Some(Self::from_env_with_gen_model(model).with_timeout_secs(timeout))
    }

    /// Override the per-request timeout.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.gen_timeout_secs = secs;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_request(&self, request: &GenerationRequest) -> ChatRequest {
        let mut messages = Vec::with_capacity(2);
        if !request.system_prompt.is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: request.system_prompt.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.user_prompt.clone(),
        });

        let options = ChatOptions {
            temperature: request.temperature,
            num_predict: request.max_tokens,
        };

        ChatRequest {
            model: self.gen_model.clone(),
            messages,
            stream: false,
            format: request.json.then(|| serde_json::json!("json")),
            // Thinking models leak reasoning into constrained JSON output.
            think: request.json.then_some(false),
            options: (!options.is_empty()).then_some(options),
        }
    }
}

impl Default for OllamaBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize, Default)]
struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

impl ChatOptions {
    fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.num_predict.is_none()
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    think: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ChatOptions>,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[async_trait]
impl GenerationBackend for OllamaBackend {
    #[instrument(skip(self, request), fields(subsystem = "inference", component = "ollama", op = "invoke", model = %self.gen_model, prompt_len = request.user_prompt.len(), json = request.json))]
    async fn invoke(&self, request: GenerationRequest) -> Result<GenerationResponse> {
        let start = Instant::now();
        let body = self.chat_request(&request);

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(Duration::from_secs(self.gen_timeout_secs))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Inference(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Inference(format!(
                "Ollama returned {}: {}",
                status, body
            )));
        }

        let result: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Inference(format!("Failed to parse response: {}", e)))?;

        let text = result.message.content;
        let elapsed = start.elapsed().as_millis() as u64;
        debug!(
            response_len = text.len(),
            duration_ms = elapsed,
            "Generation complete"
        );
        if elapsed > SLOW_GENERATION_MS {
            warn!(duration_ms = elapsed, slow = true, "Slow generation");
        }
        Ok(GenerationResponse { text })
    }

    fn model_name(&self) -> &str {
        &self.gen_model
    }

    async fn health_check(&self) -> Result<bool> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => Ok(true),
            Ok(resp) => {
                warn!(status = %resp.status(), "Ollama health check failed");
                Ok(false)
            }
            Err(e) => {
                warn!(error = %e, "Ollama health check error");
                Ok(false)
            }
        }
    }
}
