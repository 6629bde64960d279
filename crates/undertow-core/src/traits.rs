//! Core traits for undertow abstractions.
//!
//! These traits define the interfaces that concrete implementations
//! must satisfy, enabling pluggable backends and testability.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// TASK QUEUE
// =============================================================================

/// Persistent store for deep retrieval tasks.
///
/// Implementations must make [`claim_next`](Self::claim_next) atomic across
/// concurrent callers and must reject transitions out of terminal states.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert a new pending task.
    async fn enqueue(&self, task: NewTask) -> Result<Uuid>;

    /// Claim the highest-priority, oldest pending task and mark it running.
    async fn claim_next(&self) -> Result<Option<Task>>;

    /// Overwrite the progress record of a running task.
    async fn update_progress(&self, task_id: Uuid, progress: &TaskProgress) -> Result<()>;

    /// Mark a running task complete with its result.
    async fn complete(&self, task_id: Uuid, result: &ResurfaceRecord, duration_ms: i64)
        -> Result<()>;

    /// Mark a running task failed.
    async fn fail(&self, task_id: Uuid, error: &str) -> Result<()>;

    /// Get task by ID.
    async fn get(&self, task_id: Uuid) -> Result<Option<Task>>;

    /// Completed tasks for a conversation whose record is worth delivering, oldest first.
    async fn list_resurfaceable(
        &self,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Task>>;

    /// Get pending task count.
    async fn pending_count(&self) -> Result<i64>;

    /// Counts by status.
    async fn queue_stats(&self) -> Result<QueueStats>;
}

// =============================================================================
// GENERATION
// =============================================================================

/// A single model invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Ask the backend to constrain output to JSON when it supports it.
    #[serde(default)]
    pub json: bool,
}

impl GenerationRequest {
    pub fn new(system_prompt: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }
}

/// Model output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub text: String,
}

/// Backend for text generation.
///
/// The pipeline uses two tiers through the same interface: a low-latency
/// model for the gate decision and a capable model for everything else.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Run one invocation.
    async fn invoke(&self, request: GenerationRequest) -> Result<GenerationResponse>;

    /// Get the model name being used.
    fn model_name(&self) -> &str;

    /// Check if the backend is available and responding.
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

// =============================================================================
// KNOWLEDGE CAPABILITY SURFACE
// =============================================================================

/// Read-only query functions over the knowledge store.
///
/// Every call is scoped to the user (and optional workspace) in `scope`.
/// Deduplication is local and lives next to the executor's capability binding.
#[async_trait]
pub trait KnowledgeSurface: Send + Sync {
    async fn semantic_search(
        &self,
        scope: &RetrievalScope,
        query: &str,
        options: SemanticSearchOptions,
    ) -> Result<Vec<Finding>>;

    async fn keyword_grep(
        &self,
        scope: &RetrievalScope,
        pattern: &str,
        options: GrepOptions,
    ) -> Result<Vec<Finding>>;

    /// Graph neighbours of a finding.
    async fn get_connected(&self, scope: &RetrievalScope, finding_id: &str)
        -> Result<Vec<Finding>>;

    /// Batch lookup by source id.
    async fn get_nodes(&self, scope: &RetrievalScope, ids: &[String]) -> Result<Vec<Finding>>;

    async fn search_by_time(&self, scope: &RetrievalScope, range: TimeRange)
        -> Result<Vec<Finding>>;
}
