//! PostgreSQL task queue integration tests.
//!
//! Require a reachable database (`DATABASE_URL`); run with `cargo test -- --ignored`.

use std::collections::HashSet;

use undertow_db::test_fixtures::test_database_url;
use undertow_db::{
    Database, Error, NewTask, ResurfaceRecord, TaskPriority, TaskRepository, TaskStatus,
};
use uuid::Uuid;

async fn setup() -> Database {
    let _ = dotenvy::dotenv();
    let db = Database::connect(&test_database_url())
        .await
        .expect("test database reachable");
    sqlx::migrate!("../../migrations")
        .run(&db.pool)
        .await
        .expect("migrations apply");
    db
}

fn unique_conversation() -> String {
    format!("conv-{}", Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_enqueue_claim_complete_round() {
    let db = setup().await;
    let conv = unique_conversation();

    let id = db
        .tasks
        .enqueue(NewTask::new("pricing history", "user-1", &conv).with_priority(TaskPriority::High))
        .await
        .unwrap();

    // Other suites may share the queue; drain until ours appears.
    let mut claimed = None;
    while let Some(task) = db.tasks.claim_next().await.unwrap() {
        if task.id == id {
            claimed = Some(task);
            break;
        }
    }
    let claimed = claimed.expect("enqueued task is claimable");
    assert_eq!(claimed.status, TaskStatus::Running);
    assert!(claimed.started_at.is_some());

    let mut record = ResurfaceRecord::empty();
    record.summary = "Two more threads on pricing turned up.".into();
    record.total_findings = 2;
    db.tasks.complete(id, &record, 1234).await.unwrap();

    let stored = db.tasks.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Complete);
    assert_eq!(stored.duration_ms, Some(1234));
    assert_eq!(stored.result, Some(record));

    let surfaced = db.tasks.list_resurfaceable(&conv, None, 20).await.unwrap();
    assert_eq!(surfaced.len(), 1);
    assert_eq!(surfaced[0].id, id);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_terminal_write_is_guarded() {
    let db = setup().await;
    let conv = unique_conversation();
    let id = db
        .tasks
        .enqueue(NewTask::new("x", "user-1", &conv).with_priority(TaskPriority::High))
        .await
        .unwrap();

    let err = db.tasks.fail(id, "too early").await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: TaskStatus::Pending,
            ..
        }
    ));

    while let Some(task) = db.tasks.claim_next().await.unwrap() {
        if task.id == id {
            break;
        }
    }
    db.tasks.fail(id, "knowledge store down").await.unwrap();

    let err = db
        .tasks
        .complete(id, &ResurfaceRecord::empty(), 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: TaskStatus::Failed,
            to: TaskStatus::Complete,
            ..
        }
    ));

    let stored = db.tasks.get(id).await.unwrap().unwrap();
    assert_eq!(stored.error.as_deref(), Some("knowledge store down"));
    assert!(stored.result.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires PostgreSQL"]
async fn test_claim_next_is_exclusive_under_contention() {
    let db = setup().await;
    let conv = unique_conversation();

    let mut ours = HashSet::new();
    for i in 0..20 {
        let id = db
            .tasks
            .enqueue(NewTask::new(format!("t{}", i), "user-1", &conv))
            .await
            .unwrap();
        ours.insert(id);
    }

    let mut handles = Vec::new();
    for _ in 0..6 {
        let repo = undertow_db::PgTaskRepository::new(db.pool.clone());
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(task) = repo.claim_next().await.unwrap() {
                claimed.push(task.id);
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for claimed in futures::future::join_all(handles).await {
        all.extend(claimed.unwrap());
    }
    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(unique.len(), all.len(), "a task was claimed twice");
    assert!(ours.is_subset(&unique));
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_unknown_task_not_found() {
    let db = setup().await;
    let err = db.tasks.fail(Uuid::new_v4(), "x").await.unwrap_err();
    assert!(matches!(err, Error::TaskNotFound(_)));
}
