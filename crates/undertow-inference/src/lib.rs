//! # undertow-inference
//!
//! Generation backends for the deep retrieval pipeline.
//!
//! The pipeline talks to two tiers through [`GenerationBackend`]: a
//! low-latency model for the gate decision and a capable model for strategy,
//! cluster refinement and synthesis. Both tiers are usually the same backend
//! type configured with different models.
//!
//! # Feature Flags
//!
//! - `ollama` (default): Ollama `/api/chat` backend
//! - `openai`: OpenAI-compatible `/chat/completions` backend
//! - `mock`: scripted [`mock::MockGenerationBackend`] for tests
//!
//! # Example
//!
//! ```rust,no_run
//! use undertow_inference::{GenerationBackend, GenerationRequest, OllamaBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = OllamaBackend::from_env();
//!     let request = GenerationRequest::new("Answer briefly.", "Hello").with_temperature(0.2);
//!     let response = backend.invoke(request).await.unwrap();
//!     println!("{}", response.text);
//! }
//! ```

#[cfg(feature = "ollama")]
pub mod ollama;

#[cfg(feature = "openai")]
pub mod openai;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use undertow_core::*;

#[cfg(feature = "ollama")]
pub use ollama::OllamaBackend;

#[cfg(feature = "openai")]
pub use openai::{OpenAIBackend, OpenAIConfig};
