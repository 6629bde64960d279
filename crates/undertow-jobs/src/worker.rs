//! Task worker: claims deep retrieval tasks and drives each to a terminal state.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use undertow_core::{defaults, Error, Result, Task, TaskProgress, TaskRepository};

use crate::handler::{TaskContext, TaskHandler, TaskResult};

/// Configuration for the task worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Polling interval in milliseconds when the queue is empty.
    pub poll_interval_ms: u64,
    /// Maximum number of tasks processed at once.
    pub max_concurrent: usize,
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::WORKER_POLL_INTERVAL_MS,
            max_concurrent: defaults::WORKER_MAX_CONCURRENT,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `WORKER_ENABLED` | `true` | Enable/disable task processing |
    /// | `WORKER_MAX_CONCURRENT` | `4` | Max concurrent tasks |
    /// | `WORKER_POLL_INTERVAL_MS` | `1000` | Polling interval when queue is empty |
    pub fn from_env() -> Self {
        let enabled = std::env::var("WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent = std::env::var("WORKER_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::WORKER_MAX_CONCURRENT)
            .max(1);

        let poll_interval_ms = std::env::var("WORKER_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::WORKER_POLL_INTERVAL_MS);

        Self {
            poll_interval_ms,
            max_concurrent,
            enabled,
        }
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set maximum concurrent tasks (at least 1).
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the task worker.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    TaskStarted {
        task_id: Uuid,
        conversation_id: String,
    },
    TaskProgress {
        task_id: Uuid,
        progress: TaskProgress,
    },
    /// A task reached `complete`. `reportable` is false for "nothing to report".
    TaskCompleted {
        task_id: Uuid,
        conversation_id: String,
        duration_ms: i64,
        reportable: bool,
    },
    TaskFailed {
        task_id: Uuid,
        conversation_id: String,
        error: String,
    },
    WorkerStarted,
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    /// Signal the worker to shut down after its in-flight tasks finish.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Task worker that processes deep retrieval tasks from the queue.
pub struct TaskWorker {
    repo: Arc<dyn TaskRepository>,
    handler: Arc<dyn TaskHandler>,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
    wake: Option<Arc<Notify>>,
}

impl TaskWorker {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        handler: Arc<dyn TaskHandler>,
        config: WorkerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            repo,
            handler,
            config,
            event_tx,
            wake: None,
        }
    }

    /// Wake the idle loop as soon as a task is enqueued instead of waiting out the poll interval.
    pub fn with_wake(mut self, notify: Arc<Notify>) -> Self {
        self.wake = Some(notify);
        self
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
        }
    }

    /// Claim up to `max_concurrent` tasks, run them to completion, repeat.
    /// Sleeps only when the queue is empty.
    #[instrument(skip(self, shutdown_rx), fields(subsystem = "jobs", component = "worker"))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Task worker is disabled, not starting");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = self.config.max_concurrent,
            handler = self.handler.name(),
            "Task worker started"
        );

        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Task worker received shutdown signal");
                break;
            }

            let mut claimed = 0;
            let mut tasks = tokio::task::JoinSet::new();

            for _ in 0..self.config.max_concurrent {
                match self.claim_task().await {
                    Some(task) => {
                        claimed += 1;
                        let worker = self.clone_refs();
                        tasks.spawn(async move {
                            worker.execute_task(task).await;
                        });
                    }
                    None => break,
                }
            }

            if claimed == 0 {
                let wake = self.wake.clone();
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Task worker received shutdown signal");
                        break;
                    }
                    _ = sleep(poll_interval) => {}
                    _ = async move {
                        match wake {
                            Some(notify) => notify.notified().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        debug!("Woken by enqueue");
                    }
                }
            } else {
                debug!(claimed, "Processing concurrent task batch");
                while let Some(result) = tasks.join_next().await {
                    if let Err(e) = result {
                        error!(error = ?e, "Task execution aborted");
                    }
                }
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Task worker stopped");
    }

    async fn claim_task(&self) -> Option<Task> {
        match self.repo.claim_next().await {
            Ok(task) => task,
            Err(e) => {
                error!(error = ?e, "Failed to claim task");
                None
            }
        }
    }

    fn clone_refs(&self) -> TaskWorkerRef {
        TaskWorkerRef {
            repo: self.repo.clone(),
            handler: self.handler.clone(),
            event_tx: self.event_tx.clone(),
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Sender side of the event channel, for bridges that subscribe per client.
    pub fn event_bus(&self) -> broadcast::Sender<WorkerEvent> {
        self.event_tx.clone()
    }

    pub async fn pending_count(&self) -> Result<i64> {
        self.repo.pending_count().await
    }
}

/// What a spawned task needs from the worker.
struct TaskWorkerRef {
    repo: Arc<dyn TaskRepository>,
    handler: Arc<dyn TaskHandler>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl TaskWorkerRef {
    /// Run one claimed task and write its terminal state.
    async fn execute_task(self, task: Task) {
        let start = Instant::now();
        let task_id = task.id;
        let conversation_id = task.conversation_id.clone();

        info!(%task_id, %conversation_id, "Processing task");
        let _ = self.event_tx.send(WorkerEvent::TaskStarted {
            task_id,
            conversation_id: conversation_id.clone(),
        });

        // Progress writes go through one forwarder so they land in order and
        // never hold up the pipeline.
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<TaskProgress>();
        let repo = self.repo.clone();
        let event_tx = self.event_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(progress) = progress_rx.recv().await {
                if let Err(e) = repo.update_progress(task_id, &progress).await {
                    warn!(%task_id, error = %e, "Failed to record task progress");
                }
                let _ = event_tx.send(WorkerEvent::TaskProgress { task_id, progress });
            }
        });

        let ctx = TaskContext::new(task).with_progress_callback(move |progress| {
            let _ = progress_tx.send(progress);
        });

        let result = match AssertUnwindSafe(self.handler.execute(ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(%task_id, panic = %message, "Task handler panicked");
                TaskResult::Failed(format!("Task handler panicked: {}", message))
            }
        };

        if let Err(e) = forwarder.await {
            warn!(%task_id, error = ?e, "Progress forwarder aborted");
        }

        let duration_ms = start.elapsed().as_millis() as i64;
        if let Err(e) = self
            .finish(task_id, &conversation_id, result, duration_ms)
            .await
        {
            error!(%task_id, error = %e, "Failed to write task result");
            let message = e.to_string();
            match self.repo.fail(task_id, &message).await {
                Ok(()) => {
                    let _ = self.event_tx.send(WorkerEvent::TaskFailed {
                        task_id,
                        conversation_id,
                        error: message,
                    });
                }
                Err(e) => error!(%task_id, error = %e, "Failed to mark task as failed"),
            }
        }
    }

    async fn finish(
        &self,
        task_id: Uuid,
        conversation_id: &str,
        result: TaskResult,
        duration_ms: i64,
    ) -> Result<()> {
        match result {
            TaskResult::Success(record) => {
                self.repo.complete(task_id, &record, duration_ms).await?;
                let reportable = record.is_reportable();
                info!(
                    %task_id,
                    duration_ms,
                    reportable,
                    result_count = record.total_findings,
                    "Task completed"
                );
                let _ = self.event_tx.send(WorkerEvent::TaskCompleted {
                    task_id,
                    conversation_id: conversation_id.to_string(),
                    duration_ms,
                    reportable,
                });
            }
            TaskResult::Failed(error) => {
                self.repo.fail(task_id, &error).await?;
                warn!(%task_id, %error, duration_ms, "Task failed");
                let _ = self.event_tx.send(WorkerEvent::TaskFailed {
                    task_id,
                    conversation_id: conversation_id.to_string(),
                    error,
                });
            }
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Builder for creating a task worker.
pub struct WorkerBuilder {
    repo: Arc<dyn TaskRepository>,
    config: WorkerConfig,
    handler: Option<Arc<dyn TaskHandler>>,
    wake: Option<Arc<Notify>>,
}

impl WorkerBuilder {
    pub fn new(repo: Arc<dyn TaskRepository>) -> Self {
        Self {
            repo,
            config: WorkerConfig::default(),
            handler: None,
            wake: None,
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_handler<H: TaskHandler + 'static>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn with_wake(mut self, notify: Arc<Notify>) -> Self {
        self.wake = Some(notify);
        self
    }

    /// Build the worker. A handler is required.
    pub fn build(self) -> Result<TaskWorker> {
        let handler = self
            .handler
            .ok_or_else(|| Error::Config("Task worker has no handler".into()))?;
        let worker = TaskWorker::new(self.repo, handler, self.config);
        Ok(match self.wake {
            Some(notify) => worker.with_wake(notify),
            None => worker,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use undertow_core::{
        NewTask, ProgressStage, QueueStats, ResurfaceRecord, TaskStatus,
    };
    use undertow_db::MemoryTaskRepository;

    use crate::handler::NoOpHandler;

    struct ScriptedHandler {
        outcome: &'static str,
    }

    #[async_trait]
    impl TaskHandler for ScriptedHandler {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn execute(&self, ctx: TaskContext) -> TaskResult {
            ctx.report_progress(TaskProgress::new(ProgressStage::Searching).with_percent(10));
            match self.outcome {
                "panic" => panic!("knowledge surface exploded"),
                "fail" => TaskResult::Failed("bad input".into()),
                _ => {
                    let mut record = ResurfaceRecord::empty();
                    record.summary = format!("Found more on {}", ctx.task.objective);
                    record.total_findings = 2;
                    TaskResult::Success(record)
                }
            }
        }
    }

    /// Delegates to a memory repository but refuses to record completions.
    struct BrokenCompleteRepo(MemoryTaskRepository);

    #[async_trait]
    impl TaskRepository for BrokenCompleteRepo {
        async fn enqueue(&self, task: NewTask) -> Result<Uuid> {
            self.0.enqueue(task).await
        }
        async fn claim_next(&self) -> Result<Option<Task>> {
            self.0.claim_next().await
        }
        async fn update_progress(&self, task_id: Uuid, progress: &TaskProgress) -> Result<()> {
            self.0.update_progress(task_id, progress).await
        }
        async fn complete(&self, _: Uuid, _: &ResurfaceRecord, _: i64) -> Result<()> {
            Err(Error::Internal("result column rejected".into()))
        }
        async fn fail(&self, task_id: Uuid, error: &str) -> Result<()> {
            self.0.fail(task_id, error).await
        }
        async fn get(&self, task_id: Uuid) -> Result<Option<Task>> {
            self.0.get(task_id).await
        }
        async fn list_resurfaceable(
            &self,
            conversation_id: &str,
            since: Option<DateTime<Utc>>,
            limit: i64,
        ) -> Result<Vec<Task>> {
            self.0.list_resurfaceable(conversation_id, since, limit).await
        }
        async fn pending_count(&self) -> Result<i64> {
            self.0.pending_count().await
        }
        async fn queue_stats(&self) -> Result<QueueStats> {
            self.0.queue_stats().await
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig::default().with_poll_interval(10)
    }

    async fn next_terminal(rx: &mut broadcast::Receiver<WorkerEvent>) -> WorkerEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(event @ WorkerEvent::TaskCompleted { .. })
                    | Ok(event @ WorkerEvent::TaskFailed { .. }) => return event,
                    Ok(_) => continue,
                    Err(e) => panic!("event stream closed: {}", e),
                }
            }
        })
        .await
        .expect("no terminal event")
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval_ms, defaults::WORKER_POLL_INTERVAL_MS);
        assert_eq!(config.max_concurrent, defaults::WORKER_MAX_CONCURRENT);
        assert!(config.enabled);
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_poll_interval(250)
            .with_max_concurrent(0)
            .with_enabled(false);
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.max_concurrent, 1);
        assert!(!config.enabled);
    }

    #[test]
    fn test_worker_event_serializes_tagged() {
        let event = WorkerEvent::TaskCompleted {
            task_id: Uuid::nil(),
            conversation_id: "c1".into(),
            duration_ms: 12,
            reportable: true,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "task_completed");
        assert_eq!(value["conversation_id"], "c1");
        assert_eq!(value["reportable"], true);
    }

    #[test]
    fn test_builder_requires_handler() {
        let repo: Arc<dyn TaskRepository> = Arc::new(MemoryTaskRepository::new());
        assert!(matches!(
            WorkerBuilder::new(repo).build(),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_success_completes_task() {
        let repo = MemoryTaskRepository::new();
        let id = repo
            .enqueue(NewTask::new("pricing", "u1", "c1"))
            .await
            .unwrap();

        let worker = WorkerBuilder::new(Arc::new(repo.clone()))
            .with_config(fast_config())
            .with_handler(ScriptedHandler { outcome: "ok" })
            .build()
            .unwrap();
        let mut events = worker.events();
        let handle = worker.start();

        match next_terminal(&mut events).await {
            WorkerEvent::TaskCompleted {
                task_id,
                reportable,
                ..
            } => {
                assert_eq!(task_id, id);
                assert!(reportable);
            }
            other => panic!("unexpected event {:?}", other),
        }
        handle.shutdown().await.unwrap();

        let task = repo.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Complete);
        assert_eq!(
            task.result.unwrap().summary,
            "Found more on pricing".to_string()
        );
        assert!(task.duration_ms.is_some());
        assert!(task.error.is_none());
    }

    #[tokio::test]
    async fn test_handler_failure_marks_failed() {
        let repo = MemoryTaskRepository::new();
        let id = repo.enqueue(NewTask::new("x", "u1", "c1")).await.unwrap();

        let worker = TaskWorker::new(
            Arc::new(repo.clone()),
            Arc::new(ScriptedHandler { outcome: "fail" }),
            fast_config(),
        );
        let mut events = worker.events();
        let _handle = worker.start();

        assert!(matches!(
            next_terminal(&mut events).await,
            WorkerEvent::TaskFailed { ref error, .. } if error == "bad input"
        ));
        let task = repo.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("bad input"));
        assert!(task.result.is_none());
    }

    #[tokio::test]
    async fn test_panicking_handler_is_not_stranded() {
        let repo = MemoryTaskRepository::new();
        let id = repo.enqueue(NewTask::new("x", "u1", "c1")).await.unwrap();

        let worker = TaskWorker::new(
            Arc::new(repo.clone()),
            Arc::new(ScriptedHandler { outcome: "panic" }),
            fast_config(),
        );
        let mut events = worker.events();
        let _handle = worker.start();

        next_terminal(&mut events).await;
        let task = repo.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task
            .error
            .unwrap()
            .contains("knowledge surface exploded"));
    }

    #[tokio::test]
    async fn test_terminal_write_failure_marks_failed() {
        let inner = MemoryTaskRepository::new();
        let id = inner.enqueue(NewTask::new("x", "u1", "c1")).await.unwrap();

        let worker = TaskWorker::new(
            Arc::new(BrokenCompleteRepo(inner.clone())),
            Arc::new(ScriptedHandler { outcome: "ok" }),
            fast_config(),
        );
        let mut events = worker.events();
        let _handle = worker.start();

        next_terminal(&mut events).await;
        let task = inner.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("result column rejected"));
    }

    #[tokio::test]
    async fn test_progress_events_forwarded() {
        let repo = MemoryTaskRepository::new();
        repo.enqueue(NewTask::new("x", "u1", "c1")).await.unwrap();

        let worker = TaskWorker::new(
            Arc::new(repo.clone()),
            Arc::new(ScriptedHandler { outcome: "ok" }),
            fast_config(),
        );
        let mut events = worker.events();
        let _handle = worker.start();

        let mut seen_progress = false;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await.unwrap() {
                    WorkerEvent::TaskProgress { progress, .. } => {
                        assert_eq!(progress.stage, ProgressStage::Searching);
                        seen_progress = true;
                    }
                    WorkerEvent::TaskCompleted { .. } => break,
                    _ => {}
                }
            }
        })
        .await
        .unwrap();
        assert!(seen_progress);
    }

    #[tokio::test]
    async fn test_wake_on_enqueue() {
        let repo = MemoryTaskRepository::new();
        let worker = WorkerBuilder::new(Arc::new(repo.clone()))
            .with_config(WorkerConfig::default().with_poll_interval(60_000))
            .with_handler(NoOpHandler)
            .with_wake(repo.task_notify())
            .build()
            .unwrap();
        let mut events = worker.events();
        let _handle = worker.start();

        // Let the loop reach its idle wait.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let id = repo.enqueue(NewTask::new("x", "u1", "c1")).await.unwrap();

        match next_terminal(&mut events).await {
            WorkerEvent::TaskCompleted {
                task_id,
                reportable,
                ..
            } => {
                assert_eq!(task_id, id);
                assert!(!reportable);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disabled_worker_claims_nothing() {
        let repo = MemoryTaskRepository::new();
        repo.enqueue(NewTask::new("x", "u1", "c1")).await.unwrap();

        let worker = TaskWorker::new(
            Arc::new(repo.clone()),
            Arc::new(NoOpHandler),
            fast_config().with_enabled(false),
        );
        let _handle = worker.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(repo.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_many_tasks_each_terminal_once() {
        let repo = MemoryTaskRepository::new();
        for i in 0..10 {
            repo.enqueue(NewTask::new(format!("q{}", i), "u1", "c1"))
                .await
                .unwrap();
        }

        let worker = TaskWorker::new(
            Arc::new(repo.clone()),
            Arc::new(ScriptedHandler { outcome: "ok" }),
            fast_config().with_max_concurrent(3),
        );
        let mut events = worker.events();
        let _handle = worker.start();

        for _ in 0..10 {
            next_terminal(&mut events).await;
        }
        let stats = repo.queue_stats().await.unwrap();
        assert_eq!(stats.complete, 10);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
