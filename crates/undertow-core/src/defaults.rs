//! Centralized default constants for undertow.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic numbers.

// =============================================================================
// INFERENCE
// =============================================================================

/// Default Ollama endpoint.
pub const OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Default capable generation model (strategy, clustering, synthesis).
pub const GEN_MODEL: &str = "gpt-oss:20b";

/// Default low-latency model for the gate decision.
pub const FAST_GEN_MODEL: &str = "granite4:3b";

/// Timeout for capable generation requests (seconds).
pub const GEN_TIMEOUT_SECS: u64 = 120;

/// Timeout for fast generation requests (seconds).
pub const FAST_GEN_TIMEOUT_SECS: u64 = 30;

/// Gate sampling: deterministic and short.
pub const GATE_TEMPERATURE: f32 = 0.0;
pub const GATE_MAX_TOKENS: u32 = 80;

/// Strategy sampling.
pub const STRATEGY_TEMPERATURE: f32 = 0.2;
pub const STRATEGY_MAX_TOKENS: u32 = 1200;

/// Cluster refinement sampling.
pub const CLUSTER_TEMPERATURE: f32 = 0.1;
pub const CLUSTER_MAX_TOKENS: u32 = 1500;

/// Synthesis sampling.
pub const SYNTHESIS_TEMPERATURE: f32 = 0.7;
pub const SYNTHESIS_MAX_TOKENS: u32 = 300;

/// Conversation turns shown to the gate and synthesis prompts.
pub const RECENT_TURNS_WINDOW: usize = 4;

// =============================================================================
// DEPTH CLASSIFIER
// =============================================================================

/// Queries with at most this many words default to `quick`.
pub const QUICK_MAX_WORDS: usize = 5;

/// Queries with at least this many words default to `comprehensive`.
pub const COMPREHENSIVE_MIN_WORDS: usize = 15;

// =============================================================================
// PLAN EXECUTION
// =============================================================================

/// Hard wall-clock limit for one plan execution.
pub const PLAN_TIMEOUT_SECS: u64 = 30;

/// Maximum number of steps accepted in a plan.
pub const PLAN_MAX_STEPS: usize = 16;

/// Confidence assigned when a plan does not report a usable one.
pub const DEFAULT_CONFIDENCE: f32 = 0.5;

/// Default `semantic_search` limit.
pub const SEMANTIC_SEARCH_LIMIT: usize = 20;

/// Default `semantic_search` similarity floor.
pub const SEMANTIC_SEARCH_THRESHOLD: f32 = 0.3;

/// Default `keyword_grep` limit.
pub const GREP_LIMIT: usize = 20;

/// Default `search_by_time` limit.
pub const TIME_SEARCH_LIMIT: usize = 50;

/// Lookback used when a `since` expression cannot be parsed.
pub const TIME_SEARCH_FALLBACK_DAYS: i64 = 7;

/// Upper bound on any single capability `limit`.
pub const CAPABILITY_MAX_LIMIT: usize = 200;

// =============================================================================
// CLUSTERING
// =============================================================================

pub const CLUSTER_MAX_CLUSTERS: usize = 5;
pub const CLUSTER_MAX_PER_CLUSTER: usize = 10;
pub const CLUSTER_MIN_SIZE: usize = 2;

/// Below this many findings the model is skipped entirely.
pub const CLUSTER_FAST_PATH_THRESHOLD: usize = 10;

/// Maximum findings presented to the refinement model.
pub const CLUSTER_MAX_PRESENTED: usize = 50;

/// Ceiling on the unclustered bucket.
pub const UNCLUSTERED_CEILING: usize = 20;

/// Characters of finding content shown per item in prompts.
pub const PROMPT_EXCERPT_CHARS: usize = 240;

// =============================================================================
// WORKER
// =============================================================================

/// Polling interval when the queue is empty.
pub const WORKER_POLL_INTERVAL_MS: u64 = 1_000;

/// Maximum tasks processed concurrently by one worker pool.
pub const WORKER_MAX_CONCURRENT: usize = 4;

/// Broadcast channel capacity for worker events.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// KNOWLEDGE SERVICE
// =============================================================================

/// Default knowledge service endpoint.
pub const KNOWLEDGE_URL: &str = "http://127.0.0.1:8700";

/// Timeout for knowledge service requests (seconds).
pub const KNOWLEDGE_TIMEOUT_SECS: u64 = 20;

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 3000;

/// Default page size for resurfacing reads.
pub const RESURFACE_PAGE_LIMIT: i64 = 20;
