//! # undertow-retrieval
//!
//! The deep retrieval pipeline:
//!
//! - [`depth`]: pure query depth classification
//! - [`decision`]: gate decision and retrieval plan generation
//! - [`plan`] / [`executor`]: the plan language and its sandboxed interpreter
//! - [`cluster`]: grouping findings into themed clusters
//! - [`synthesis`]: the conversational follow-up
//! - [`engine`]: all of the above wired together for one task
//!
//! The knowledge store is reached only through
//! [`KnowledgeSurface`](undertow_core::KnowledgeSurface); [`knowledge`]
//! provides an HTTP implementation.

pub mod capabilities;
pub mod cluster;
pub mod config;
pub mod decision;
pub mod depth;
pub mod engine;
pub mod executor;
pub mod knowledge;
pub mod normalize;
pub mod plan;
pub mod prompts;
pub mod synthesis;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

// Re-export core types
pub use undertow_core::*;

pub use capabilities::ScopedCapabilities;
pub use cluster::ClusteringEngine;
pub use config::{ClusterOptions, RetrievalConfig};
pub use decision::{Decision, DecisionPipeline, GateDecision};
pub use depth::{classify, RetrievalDepth};
pub use engine::{NoProgress, ProgressSink, RetrievalEngine, RetrievalRequest};
pub use executor::PlanExecutor;
pub use knowledge::{HttpKnowledgeSurface, KnowledgeServiceConfig};
pub use normalize::{normalize_finding, normalize_output};
pub use plan::{Plan, PlanError, Step};
pub use synthesis::Synthesizer;
