//! End-to-end deep retrieval for one task.
//!
//! Stages run strictly in sequence: decide (when no plan was supplied),
//! execute, cluster, synthesize. Each stage absorbs its own failures, so
//! [`RetrievalEngine::run`] always produces a record.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info};
use undertow_core::{
    ConversationContext, GenerationBackend, KnowledgeSurface, ProgressStage, ResurfaceRecord,
    RetrievalScope, TaskProgress,
};

use crate::cluster::ClusteringEngine;
use crate::config::RetrievalConfig;
use crate::decision::{Decision, DecisionPipeline};
use crate::executor::PlanExecutor;
use crate::synthesis::Synthesizer;

/// Receives advisory progress between stages.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, progress: TaskProgress);
}

/// Discards progress.
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn report(&self, _progress: TaskProgress) {}
}

/// Inputs for one pipeline run.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalRequest<'a> {
    pub query: &'a str,
    /// Pre-generated plan; `None` runs the decision pipeline first.
    pub plan: Option<&'a str>,
    pub scope: &'a RetrievalScope,
    pub context: &'a ConversationContext,
}

/// All pipeline stages wired together.
pub struct RetrievalEngine {
    decision: DecisionPipeline,
    executor: PlanExecutor,
    clustering: ClusteringEngine,
    synthesizer: Synthesizer,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    /// `fast` backs the gate; `capable` backs strategy, clustering and synthesis.
    pub fn new(
        fast: Arc<dyn GenerationBackend>,
        capable: Arc<dyn GenerationBackend>,
        knowledge: Arc<dyn KnowledgeSurface>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            decision: DecisionPipeline::new(fast, capable.clone())
                .with_recent_turns_window(config.recent_turns_window),
            executor: PlanExecutor::from_config(knowledge, &config),
            clustering: ClusteringEngine::new(capable.clone()).with_options(config.cluster),
            synthesizer: Synthesizer::new(capable),
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn decision(&self) -> &DecisionPipeline {
        &self.decision
    }

    /// Run every stage and build the resurface record.
    ///
    /// A declined decision or an empty retrieval yields
    /// [`ResurfaceRecord::empty`] without clustering or synthesis.
    pub async fn run(
        &self,
        request: RetrievalRequest<'_>,
        progress: &dyn ProgressSink,
    ) -> ResurfaceRecord {
        let start = Instant::now();

        let plan = match request.plan.map(str::trim).filter(|p| !p.is_empty()) {
            Some(plan) => plan.to_string(),
            None => match self.decision.decide(request.query, request.context).await {
                Decision::Retrieve { plan, .. } => plan,
                Decision::Skip { depth, reason } => {
                    debug!(
                        subsystem = "retrieval",
                        component = "engine",
                        depth = %depth,
                        reason = %reason,
                        "Retrieval declined"
                    );
                    return ResurfaceRecord::empty();
                }
            },
        };

        progress
            .report(
                TaskProgress::new(ProgressStage::Searching)
                    .with_message("Executing retrieval plan"),
            )
            .await;
        let retrieval = self.executor.execute(&plan, request.scope).await;
        if retrieval.is_empty() {
            info!(
                subsystem = "retrieval",
                component = "engine",
                duration_ms = start.elapsed().as_millis() as u64,
                "No findings, nothing to report"
            );
            return ResurfaceRecord::empty();
        }

        progress
            .report(
                TaskProgress::new(ProgressStage::Analyzing)
                    .with_found(retrieval.findings.len())
                    .with_percent(40),
            )
            .await;
        progress
            .report(
                TaskProgress::new(ProgressStage::Clustering)
                    .with_found(retrieval.findings.len())
                    .with_percent(50),
            )
            .await;
        let clustered = self
            .clustering
            .cluster(&retrieval.findings, request.query)
            .await;

        progress
            .report(
                TaskProgress::new(ProgressStage::Synthesizing)
                    .with_found(clustered.total_findings)
                    .with_processed(clustered.clusters.len())
                    .with_percent(80),
            )
            .await;
        let summary = self
            .synthesizer
            .synthesize(
                &clustered,
                request.query,
                request.context.windowed(self.config.recent_turns_window),
            )
            .await;

        let record = ResurfaceRecord::from_clustered(summary, clustered, retrieval.confidence);
        info!(
            subsystem = "retrieval",
            component = "engine",
            result_count = record.total_findings,
            cluster_count = record.clusters.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Deep retrieval complete"
        );
        record
    }
}
