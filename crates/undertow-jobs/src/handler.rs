//! Task handlers run by the worker for each claimed task.

use async_trait::async_trait;
use uuid::Uuid;

use undertow_core::{ResurfaceRecord, RetrievalScope, Task, TaskProgress};

/// Progress callback type for task handlers.
pub type ProgressCallback = Box<dyn Fn(TaskProgress) + Send + Sync>;

/// Context provided to task handlers.
pub struct TaskContext {
    /// The claimed task, already in `running`.
    pub task: Task,
    progress_callback: Option<ProgressCallback>,
}

impl TaskContext {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            progress_callback: None,
        }
    }

    /// Set the progress callback.
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(TaskProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    /// Report advisory progress. Never blocks and never fails.
    pub fn report_progress(&self, progress: TaskProgress) {
        if let Some(ref callback) = self.progress_callback {
            callback(progress);
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task.id
    }

    pub fn scope(&self) -> RetrievalScope {
        self.task.scope()
    }
}

/// Result of task execution.
#[derive(Debug)]
pub enum TaskResult {
    /// Completed; the record may be empty ("nothing to report").
    Success(ResurfaceRecord),
    /// Failed with an error message.
    Failed(String),
}

/// Trait for task handlers.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Execute the task.
    async fn execute(&self, ctx: TaskContext) -> TaskResult;
}

/// Handler that completes every task with an empty record.
pub struct NoOpHandler;

#[async_trait]
impl TaskHandler for NoOpHandler {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn execute(&self, _ctx: TaskContext) -> TaskResult {
        TaskResult::Success(ResurfaceRecord::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};
    use undertow_core::{NewTask, ProgressStage};

    fn task() -> Task {
        Task::from_new(
            Uuid::new_v4(),
            NewTask::new("pricing history", "u1", "c1").with_workspace("w1"),
            Utc::now(),
        )
    }

    #[test]
    fn test_context_scope() {
        let ctx = TaskContext::new(task());
        let scope = ctx.scope();
        assert_eq!(scope.user_id, "u1");
        assert_eq!(scope.workspace_id.as_deref(), Some("w1"));
        assert_eq!(scope.conversation_id, "c1");
    }

    #[test]
    fn test_report_progress_without_callback() {
        let ctx = TaskContext::new(task());
        ctx.report_progress(TaskProgress::new(ProgressStage::Searching));
    }

    #[test]
    fn test_report_progress_invokes_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let ctx = TaskContext::new(task()).with_progress_callback(move |p| {
            sink.lock().unwrap().push(p.stage);
        });

        ctx.report_progress(TaskProgress::new(ProgressStage::Searching));
        ctx.report_progress(TaskProgress::new(ProgressStage::Clustering));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ProgressStage::Searching, ProgressStage::Clustering]
        );
    }

    #[tokio::test]
    async fn test_noop_handler() {
        let result = NoOpHandler.execute(TaskContext::new(task())).await;
        assert!(matches!(result, TaskResult::Success(ref r) if *r == ResurfaceRecord::empty()));
    }
}
