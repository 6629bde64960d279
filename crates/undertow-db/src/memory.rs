//! In-process task repository.
//!
//! Same contract as [`PgTaskRepository`](crate::PgTaskRepository) behind a single
//! mutex, which makes every operation (including claim) atomic. Used by tests and
//! by single-process deployments that do not need durability.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

use undertow_core::{
    new_v7, Error, NewTask, QueueStats, ResurfaceRecord, Result, Task, TaskProgress,
    TaskRepository, TaskStatus,
};

#[derive(Default)]
struct Store {
    tasks: HashMap<Uuid, Task>,
    /// Insertion sequence, used to break `created_at` ties.
    order: Vec<Uuid>,
}

impl Store {
    fn running(&mut self, task_id: Uuid, to: TaskStatus) -> Result<&mut Task> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(Error::TaskNotFound(task_id))?;
        if !task.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                task_id,
                from: task.status,
                to,
            });
        }
        Ok(task)
    }
}

/// Mutex-backed [`TaskRepository`].
#[derive(Clone, Default)]
pub struct MemoryTaskRepository {
    store: Arc<Mutex<Store>>,
    notify: Arc<Notify>,
}

impl MemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Snapshot of every task, in enqueue order.
    pub async fn all(&self) -> Vec<Task> {
        let store = self.store.lock().await;
        store
            .order
            .iter()
            .filter_map(|id| store.tasks.get(id).cloned())
            .collect()
    }
}

fn elapsed_ms(task: &Task, now: DateTime<Utc>) -> Option<i64> {
    task.started_at.map(|s| (now - s).num_milliseconds())
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn enqueue(&self, task: NewTask) -> Result<Uuid> {
        let id = new_v7();
        let task = Task::from_new(id, task, Utc::now());
        {
            let mut store = self.store.lock().await;
            store.tasks.insert(id, task);
            store.order.push(id);
        }
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn claim_next(&self) -> Result<Option<Task>> {
        let mut store = self.store.lock().await;

        let mut best: Option<(usize, Uuid)> = None;
        for (seq, id) in store.order.iter().enumerate() {
            let Some(task) = store.tasks.get(id) else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_seq, best_id)) => {
                    let current = &store.tasks[&best_id];
                    (task.priority, std::cmp::Reverse(task.created_at), std::cmp::Reverse(seq))
                        > (
                            current.priority,
                            std::cmp::Reverse(current.created_at),
                            std::cmp::Reverse(best_seq),
                        )
                }
            };
            if better {
                best = Some((seq, *id));
            }
        }

        let Some((_, id)) = best else {
            return Ok(None);
        };
        let task = store.running(id, TaskStatus::Running)?;
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        Ok(Some(task.clone()))
    }

    async fn update_progress(&self, task_id: Uuid, progress: &TaskProgress) -> Result<()> {
        let mut store = self.store.lock().await;
        match store.tasks.get_mut(&task_id) {
            Some(task) if task.status == TaskStatus::Running => {
                task.progress = Some(progress.clone());
            }
            _ => debug!(%task_id, "Progress update ignored; task is not running"),
        }
        Ok(())
    }

    async fn complete(
        &self,
        task_id: Uuid,
        result: &ResurfaceRecord,
        duration_ms: i64,
    ) -> Result<()> {
        let mut store = self.store.lock().await;
        let task = store.running(task_id, TaskStatus::Complete)?;
        task.status = TaskStatus::Complete;
        task.result = Some(result.clone());
        task.duration_ms = Some(duration_ms);
        task.completed_at = Some(Utc::now());
        task.progress = None;
        Ok(())
    }

    async fn fail(&self, task_id: Uuid, error: &str) -> Result<()> {
        let mut store = self.store.lock().await;
        let now = Utc::now();
        let task = store.running(task_id, TaskStatus::Failed)?;
        task.status = TaskStatus::Failed;
        task.error = Some(error.to_string());
        task.duration_ms = elapsed_ms(task, now);
        task.completed_at = Some(now);
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>> {
        Ok(self.store.lock().await.tasks.get(&task_id).cloned())
    }

    async fn list_resurfaceable(
        &self,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Task>> {
        let store = self.store.lock().await;
        let mut tasks: Vec<Task> = store
            .tasks
            .values()
            .filter(|t| t.conversation_id == conversation_id)
            .filter(|t| t.status == TaskStatus::Complete)
            .filter(|t| match (since, t.completed_at) {
                (Some(since), Some(done)) => done > since,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .filter(|t| t.result.as_ref().is_some_and(ResurfaceRecord::is_reportable))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.completed_at);
        tasks.truncate(limit.max(0) as usize);
        Ok(tasks)
    }

    async fn pending_count(&self) -> Result<i64> {
        let store = self.store.lock().await;
        Ok(store
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count() as i64)
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let store = self.store.lock().await;
        let mut stats = QueueStats::default();
        for task in store.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Complete => stats.complete += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
            stats.total += 1;
        }
        Ok(stats)
    }
}
