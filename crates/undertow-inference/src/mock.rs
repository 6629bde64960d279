//! Scripted generation backend for deterministic tests.
//!
//! Responses are chosen by substring rules evaluated against the system and
//! user prompts, first match wins. Every invocation is logged so tests can
//! assert how many model calls a code path made.
//!
//! ```rust
//! use undertow_inference::mock::MockGenerationBackend;
//!
//! let backend = MockGenerationBackend::new()
//!     .with_response_mapping("Should deep retrieval run", "YES - prior discussion exists")
//!     .with_fixed_response("fallback");
//! assert_eq!(backend.call_count(), 0);
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use undertow_core::{Error, GenerationBackend, GenerationRequest, GenerationResponse, Result};

#[derive(Debug, Clone)]
enum Reply {
    Text(String),
    Fail(String),
}

#[derive(Debug, Clone)]
struct MockConfig {
    model: String,
    rules: Vec<(String, Reply)>,
    default_reply: Reply,
    latency_ms: u64,
    failure_rate: f64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            model: "mock-model".to_string(),
            rules: Vec::new(),
            default_reply: Reply::Text("Mock response".to_string()),
            latency_ms: 0,
            failure_rate: 0.0,
        }
    }
}

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub json: bool,
}

impl MockCall {
    /// Whether either prompt contains `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.system_prompt.contains(needle) || self.user_prompt.contains(needle)
    }
}

/// Scripted [`GenerationBackend`].
#[derive(Clone, Default)]
pub struct MockGenerationBackend {
    config: Arc<MockConfig>,
    call_log: Arc<Mutex<Vec<MockCall>>>,
}

impl MockGenerationBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model_name(mut self, model: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config).model = model.into();
        self
    }

    /// Response used when no rule matches.
    pub fn with_fixed_response(mut self, response: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config).default_reply = Reply::Text(response.into());
        self
    }

    /// Reply with `output` when either prompt contains `needle`.
    pub fn with_response_mapping(
        mut self,
        needle: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Arc::make_mut(&mut self.config)
            .rules
            .push((needle.into(), Reply::Text(output.into())));
        self
    }

    /// Fail with `message` when either prompt contains `needle`.
    pub fn with_failure_mapping(
        mut self,
        needle: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Arc::make_mut(&mut self.config)
            .rules
            .push((needle.into(), Reply::Fail(message.into())));
        self
    }

    /// Fail every call that no rule matches.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config).default_reply = Reply::Fail(message.into());
        self
    }

    /// Simulated latency; honours `tokio::time::pause`.
    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        Arc::make_mut(&mut self.config).latency_ms = latency_ms;
        self
    }

    /// Random failure rate in `[0, 1]`.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        Arc::make_mut(&mut self.config).failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    fn log(&self) -> MutexGuard<'_, Vec<MockCall>> {
        self.call_log.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        self.log().clone()
    }

    pub fn call_count(&self) -> usize {
        self.log().len()
    }

    /// Number of calls whose prompts mention `needle`.
    pub fn calls_mentioning(&self, needle: &str) -> usize {
        self.log().iter().filter(|c| c.mentions(needle)).count()
    }

    pub fn clear_calls(&self) {
        self.log().clear()
    }

    fn should_fail_randomly(&self) -> bool {
        use rand::Rng;
        self.config.failure_rate > 0.0 && rand::thread_rng().gen::<f64>() < self.config.failure_rate
    }
}

#[async_trait]
impl GenerationBackend for MockGenerationBackend {
    async fn invoke(&self, request: GenerationRequest) -> Result<GenerationResponse> {
        let call = MockCall {
            system_prompt: request.system_prompt,
            user_prompt: request.user_prompt,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            json: request.json,
        };

        let reply = self
            .config
            .rules
            .iter()
            .find(|(needle, _)| call.mentions(needle))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| self.config.default_reply.clone());

        self.log().push(call);

        if self.config.latency_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.config.latency_ms)).await;
        }

        if self.should_fail_randomly() {
            return Err(Error::Inference("Simulated failure".to_string()));
        }

        match reply {
            Reply::Text(text) => Ok(GenerationResponse { text }),
            Reply::Fail(message) => Err(Error::Inference(message)),
        }
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}
