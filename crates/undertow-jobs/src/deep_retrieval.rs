//! Handler that runs the deep retrieval pipeline for a claimed task.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use undertow_core::TaskProgress;
use undertow_retrieval::{ProgressSink, RetrievalEngine, RetrievalRequest};

use crate::handler::{TaskContext, TaskHandler, TaskResult};

/// Runs [`RetrievalEngine::run`] for each task. Every stage degrades instead
/// of failing, so this handler always succeeds; only the terminal write can fail.
pub struct DeepRetrievalHandler {
    engine: Arc<RetrievalEngine>,
}

impl DeepRetrievalHandler {
    pub fn new(engine: Arc<RetrievalEngine>) -> Self {
        Self { engine }
    }
}

/// Forwards engine progress to the worker's callback.
struct ContextProgress<'a>(&'a TaskContext);

#[async_trait]
impl ProgressSink for ContextProgress<'_> {
    async fn report(&self, progress: TaskProgress) {
        debug!(task_id = %self.0.task_id(), stage = progress.stage.as_str(), "Task progress");
        self.0.report_progress(progress);
    }
}

#[async_trait]
impl TaskHandler for DeepRetrievalHandler {
    fn name(&self) -> &'static str {
        "deep_retrieval"
    }

    #[instrument(skip(self, ctx), fields(subsystem = "jobs", component = "deep_retrieval", task_id = %ctx.task.id))]
    async fn execute(&self, ctx: TaskContext) -> TaskResult {
        let scope = ctx.scope();
        let record = self
            .engine
            .run(
                RetrievalRequest {
                    query: &ctx.task.objective,
                    plan: ctx.task.plan.as_deref(),
                    scope: &scope,
                    context: &ctx.task.context,
                },
                &ContextProgress(&ctx),
            )
            .await;
        TaskResult::Success(record)
    }
}
