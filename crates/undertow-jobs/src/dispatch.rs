//! Foreground entry point.
//!
//! [`Dispatcher::dispatch`] classifies the query on the caller's thread and
//! returns immediately. The gate, the strategy step and the enqueue run on a
//! spawned task, so the conversational reply is never delayed by them.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use undertow_core::{Error, NewTask, Result, TaskRepository};
use undertow_retrieval::{classify, Decision, RetrievalDepth, RetrievalEngine};

/// Outcome of a dispatch call.
#[derive(Debug)]
pub enum Dispatch {
    /// Deep retrieval is switched off.
    Disabled,
    /// Quick query; no task is created.
    Skipped { depth: RetrievalDepth },
    /// Decision and enqueue are running in the background. The handle resolves
    /// to the new task id, or `None` when the gate or strategy declined.
    Scheduled {
        depth: RetrievalDepth,
        handle: JoinHandle<Result<Option<Uuid>>>,
    },
}

impl Dispatch {
    pub fn depth(&self) -> Option<RetrievalDepth> {
        match self {
            Self::Disabled => None,
            Self::Skipped { depth } | Self::Scheduled { depth, .. } => Some(*depth),
        }
    }
}

/// Fire-and-forget front door for deep retrieval.
#[derive(Clone)]
pub struct Dispatcher {
    repo: Arc<dyn TaskRepository>,
    engine: Arc<RetrievalEngine>,
}

impl Dispatcher {
    pub fn new(repo: Arc<dyn TaskRepository>, engine: Arc<RetrievalEngine>) -> Self {
        Self { repo, engine }
    }

    /// Decide in the background and enqueue a task with the generated plan.
    ///
    /// `request.objective` is the user's query. Any plan on the request is
    /// replaced by the strategy output.
    pub fn dispatch(&self, request: NewTask) -> Dispatch {
        if !self.engine.config().enabled {
            return Dispatch::Disabled;
        }

        let depth = classify(&request.objective);
        if depth == RetrievalDepth::Quick {
            debug!(
                subsystem = "jobs",
                component = "dispatch",
                depth = %depth,
                "Quick query, no background retrieval"
            );
            return Dispatch::Skipped { depth };
        }

        let repo = self.repo.clone();
        let engine = self.engine.clone();
        let handle = tokio::spawn(async move {
            match engine
                .decision()
                .decide_at_depth(&request.objective, depth, &request.context)
                .await
            {
                Decision::Retrieve { plan, reason, .. } => {
                    let conversation_id = request.conversation_id.clone();
                    let task_id = repo.enqueue(request.with_plan(plan)).await.map_err(|e| {
                        warn!(
                            subsystem = "jobs",
                            component = "dispatch",
                            error = %e,
                            "Failed to enqueue retrieval task"
                        );
                        e
                    })?;
                    info!(
                        subsystem = "jobs",
                        component = "dispatch",
                        %task_id,
                        %conversation_id,
                        depth = %depth,
                        %reason,
                        "Deep retrieval task enqueued"
                    );
                    Ok(Some(task_id))
                }
                Decision::Skip { reason, .. } => {
                    debug!(
                        subsystem = "jobs",
                        component = "dispatch",
                        depth = %depth,
                        %reason,
                        "Deep retrieval declined"
                    );
                    Ok(None)
                }
            }
        });

        Dispatch::Scheduled { depth, handle }
    }

    /// Enqueue as-is. A task without a plan is decided by the worker.
    ///
    /// Refused with [`Error::Disabled`] when deep retrieval is switched off.
    pub async fn enqueue(&self, request: NewTask) -> Result<Uuid> {
        if !self.engine.config().enabled {
            return Err(Error::Disabled("deep retrieval is disabled".into()));
        }
        self.repo.enqueue(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use undertow_core::{ConversationContext, TaskStatus};
    use undertow_db::MemoryTaskRepository;
    use undertow_inference::mock::MockGenerationBackend;
    use undertow_retrieval::mock::MockKnowledgeSurface;
    use undertow_retrieval::RetrievalConfig;

    const PLAN: &str = r#"{"steps":[{"op":"semantic_search","query":"pricing"},{"op":"return"}]}"#;

    fn dispatcher(
        repo: &MemoryTaskRepository,
        fast: &MockGenerationBackend,
        capable: &MockGenerationBackend,
        config: RetrievalConfig,
    ) -> Dispatcher {
        let engine = RetrievalEngine::new(
            Arc::new(fast.clone()),
            Arc::new(capable.clone()),
            Arc::new(MockKnowledgeSurface::new()),
            config,
        );
        Dispatcher::new(Arc::new(repo.clone()), Arc::new(engine))
    }

    #[tokio::test]
    async fn test_quick_query_creates_no_task() {
        let repo = MemoryTaskRepository::new();
        let fast = MockGenerationBackend::new();
        let capable = MockGenerationBackend::new();
        let d = dispatcher(&repo, &fast, &capable, RetrievalConfig::default());

        let outcome = d.dispatch(NewTask::new("what is the capital of France", "u1", "c1"));
        assert!(matches!(outcome, Dispatch::Skipped { depth: RetrievalDepth::Quick }));
        assert_eq!(fast.call_count() + capable.call_count(), 0);
        assert_eq!(repo.queue_stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_comprehensive_query_enqueues_with_plan() {
        let repo = MemoryTaskRepository::new();
        let fast = MockGenerationBackend::new();
        let capable = MockGenerationBackend::new().with_fixed_response(PLAN);
        let d = dispatcher(&repo, &fast, &capable, RetrievalConfig::default());

        let outcome = d.dispatch(NewTask::new(
            "give me the full timeline of all pricing decisions and trade-offs we discussed",
            "u1",
            "c1",
        ));
        let Dispatch::Scheduled { depth, handle } = outcome else {
            panic!("expected scheduled dispatch");
        };
        assert_eq!(depth, RetrievalDepth::Comprehensive);

        let task_id = handle.await.unwrap().unwrap().unwrap();
        let task = repo.get(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.plan.as_deref(), Some(PLAN));
        // Gate bypassed: the fast backend is never called.
        assert_eq!(fast.call_count(), 0);
        assert_eq!(capable.call_count(), 1);
    }

    #[tokio::test]
    async fn test_gate_decline_creates_no_task() {
        let repo = MemoryTaskRepository::new();
        let fast = MockGenerationBackend::new().with_fixed_response("NO. Already answered.");
        let capable = MockGenerationBackend::new().with_fixed_response(PLAN);
        let d = dispatcher(&repo, &fast, &capable, RetrievalConfig::default());

        let request = NewTask::new("remind me where we landed on seat pricing with finance", "u1", "c1")
            .with_context(ConversationContext::default());
        let Dispatch::Scheduled { depth, handle } = d.dispatch(request) else {
            panic!("expected scheduled dispatch");
        };
        assert_eq!(depth, RetrievalDepth::Standard);
        assert_eq!(handle.await.unwrap().unwrap(), None);
        assert_eq!(capable.call_count(), 0);
        assert_eq!(repo.queue_stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_disabled_dispatch() {
        let repo = MemoryTaskRepository::new();
        let fast = MockGenerationBackend::new();
        let capable = MockGenerationBackend::new();
        let d = dispatcher(
            &repo,
            &fast,
            &capable,
            RetrievalConfig::default().with_enabled(false),
        );

        let outcome = d.dispatch(NewTask::new(
            "give me the full timeline of all pricing decisions",
            "u1",
            "c1",
        ));
        assert!(matches!(outcome, Dispatch::Disabled));
        assert!(outcome.depth().is_none());
    }

    #[tokio::test]
    async fn test_disabled_enqueue_is_refused() {
        let repo = MemoryTaskRepository::new();
        let fast = MockGenerationBackend::new();
        let capable = MockGenerationBackend::new();
        let d = dispatcher(
            &repo,
            &fast,
            &capable,
            RetrievalConfig::default().with_enabled(false),
        );

        let err = d
            .enqueue(NewTask::new("pricing history", "u1", "c1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Disabled(_)));
        assert_eq!(repo.queue_stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_enqueue_passes_plan_through() {
        let repo = MemoryTaskRepository::new();
        let fast = MockGenerationBackend::new();
        let capable = MockGenerationBackend::new();
        let d = dispatcher(&repo, &fast, &capable, RetrievalConfig::default());

        let id = d
            .enqueue(NewTask::new("pricing", "u1", "c1").with_plan(PLAN))
            .await
            .unwrap();
        assert_eq!(
            repo.get(id).await.unwrap().unwrap().plan.as_deref(),
            Some(PLAN)
        );
    }
}
