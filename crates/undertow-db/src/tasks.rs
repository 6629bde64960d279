//! PostgreSQL task repository.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row};
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use undertow_core::{
    new_v7, ConversationContext, Error, NewTask, QueueStats, ResurfaceRecord, Result, Task,
    TaskPriority, TaskProgress, TaskRepository, TaskStatus,
};

const TASK_COLUMNS: &str = "id, objective, plan, priority, user_id, workspace_id, conversation_id,
     status::text AS status, progress, result, error_message, duration_ms, context,
     created_at, started_at, completed_at";

/// PostgreSQL implementation of [`TaskRepository`].
pub struct PgTaskRepository {
    pool: Pool<Postgres>,
    /// Wakes idle workers when a task is enqueued.
    notify: Arc<Notify>,
}

impl PgTaskRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn task_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    fn parse_task_row(row: sqlx::postgres::PgRow) -> Result<Task> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<TaskStatus>()
            .map_err(|e| Error::Internal(format!("corrupt task row: {}", e)))?;

        let progress: Option<JsonValue> = row.try_get("progress")?;
        let result: Option<JsonValue> = row.try_get("result")?;
        let context: JsonValue = row.try_get("context")?;

        Ok(Task {
            id: row.try_get("id")?,
            objective: row.try_get("objective")?,
            plan: row.try_get("plan")?,
            priority: TaskPriority::from_rank(row.try_get("priority")?),
            user_id: row.try_get("user_id")?,
            workspace_id: row.try_get("workspace_id")?,
            conversation_id: row.try_get("conversation_id")?,
            status,
            // Progress is advisory; a row we cannot read is reported as absent.
            progress: progress.and_then(|v| serde_json::from_value::<TaskProgress>(v).ok()),
            result: result
                .map(serde_json::from_value::<ResurfaceRecord>)
                .transpose()?,
            error: row.try_get("error_message")?,
            duration_ms: row.try_get("duration_ms")?,
            context: serde_json::from_value::<ConversationContext>(context).unwrap_or_default(),
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    /// Explain why a guarded terminal write touched no row.
    async fn rejected_transition(&self, task_id: Uuid, to: TaskStatus) -> Error {
        let current: std::result::Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT status::text FROM retrieval_task WHERE id = $1")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await;

        match current {
            Ok(None) => Error::TaskNotFound(task_id),
            Ok(Some(from)) => match from.parse::<TaskStatus>() {
                Ok(from) => Error::InvalidTransition { task_id, from, to },
                Err(e) => Error::Internal(e),
            },
            Err(e) => Error::Database(e),
        }
    }
}

#[async_trait]
impl TaskRepository for PgTaskRepository {
    #[instrument(skip(self, task), fields(subsystem = "database", component = "tasks", op = "enqueue"))]
    async fn enqueue(&self, task: NewTask) -> Result<Uuid> {
        let task_id = new_v7();
        let plan = task.plan.filter(|p| !p.trim().is_empty());
        let context = serde_json::to_value(&task.context)?;

        sqlx::query(
            "INSERT INTO retrieval_task
                 (id, objective, plan, priority, user_id, workspace_id, conversation_id,
                  status, context, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending'::task_status, $8, $9)",
        )
        .bind(task_id)
        .bind(&task.objective)
        .bind(&plan)
        .bind(task.priority.rank())
        .bind(&task.user_id)
        .bind(&task.workspace_id)
        .bind(&task.conversation_id)
        .bind(&context)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(%task_id, priority = %task.priority, has_plan = plan.is_some(), "Task enqueued");
        self.notify.notify_waiters();
        Ok(task_id)
    }

    async fn claim_next(&self) -> Result<Option<Task>> {
        // SKIP LOCKED makes concurrent claimers pass over each other's rows.
        let query = format!(
            "UPDATE retrieval_task
             SET status = 'running'::task_status, started_at = $1
             WHERE id = (
                 SELECT id FROM retrieval_task
                 WHERE status = 'pending'::task_status
                 ORDER BY priority DESC, created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query(&query)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(Self::parse_task_row).transpose()
    }

    async fn update_progress(&self, task_id: Uuid, progress: &TaskProgress) -> Result<()> {
        let progress = serde_json::to_value(progress)?;
        let updated = sqlx::query(
            "UPDATE retrieval_task SET progress = $1
             WHERE id = $2 AND status = 'running'::task_status",
        )
        .bind(&progress)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if updated.rows_affected() == 0 {
            debug!(%task_id, "Progress update ignored; task is not running");
        }
        Ok(())
    }

    #[instrument(skip(self, result), fields(subsystem = "database", component = "tasks", op = "complete"))]
    async fn complete(
        &self,
        task_id: Uuid,
        result: &ResurfaceRecord,
        duration_ms: i64,
    ) -> Result<()> {
        let payload = serde_json::to_value(result)?;
        let updated = sqlx::query(
            "UPDATE retrieval_task
             SET status = 'complete'::task_status, result = $1, duration_ms = $2,
                 completed_at = $3, progress = NULL
             WHERE id = $4 AND status = 'running'::task_status",
        )
        .bind(&payload)
        .bind(duration_ms)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if updated.rows_affected() == 0 {
            let err = self.rejected_transition(task_id, TaskStatus::Complete).await;
            warn!(%task_id, error = %err, "Completion rejected");
            return Err(err);
        }

        info!(
            %task_id,
            duration_ms,
            total_findings = result.total_findings,
            clusters = result.clusters.len(),
            "Task completed"
        );
        Ok(())
    }

    #[instrument(skip(self), fields(subsystem = "database", component = "tasks", op = "fail"))]
    async fn fail(&self, task_id: Uuid, error: &str) -> Result<()> {
        let now = Utc::now();
        let updated = sqlx::query(
            "UPDATE retrieval_task
             SET status = 'failed'::task_status, error_message = $1, completed_at = $2,
                 duration_ms = (EXTRACT(EPOCH FROM ($2 - started_at)) * 1000)::bigint
             WHERE id = $3 AND status = 'running'::task_status",
        )
        .bind(error)
        .bind(now)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if updated.rows_affected() == 0 {
            return Err(self.rejected_transition(task_id, TaskStatus::Failed).await);
        }
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>> {
        let query = format!("SELECT {TASK_COLUMNS} FROM retrieval_task WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(Self::parse_task_row).transpose()
    }

    async fn list_resurfaceable(
        &self,
        conversation_id: &str,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Task>> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM retrieval_task
             WHERE conversation_id = $1
               AND status = 'complete'::task_status
               AND ($2::timestamptz IS NULL OR completed_at > $2)
               AND btrim(coalesce(result->>'summary', '')) <> ''
               AND coalesce((result->>'total_findings')::bigint, 0) > 0
             ORDER BY completed_at ASC
             LIMIT $3"
        );

        let rows = sqlx::query(&query)
            .bind(conversation_id)
            .bind(since)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_task_row).collect()
    }

    async fn pending_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM retrieval_task WHERE status = 'pending'::task_status",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(count)
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status::text, COUNT(*) FROM retrieval_task GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status.parse::<TaskStatus>() {
                Ok(TaskStatus::Pending) => stats.pending = count,
                Ok(TaskStatus::Running) => stats.running = count,
                Ok(TaskStatus::Complete) => stats.complete = count,
                Ok(TaskStatus::Failed) => stats.failed = count,
                Err(e) => warn!(error = %e, "Skipping unknown status in queue stats"),
            }
            stats.total += count;
        }
        Ok(stats)
    }
}
