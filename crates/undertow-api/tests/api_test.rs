//! Routes against an in-memory task store and scripted backends.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tower::ServiceExt;

use undertow_api::{router, AppState};
use undertow_core::{NewTask, ResurfaceRecord, TaskRepository};
use undertow_db::MemoryTaskRepository;
use undertow_inference::mock::MockGenerationBackend;
use undertow_jobs::Dispatcher;
use undertow_retrieval::mock::MockKnowledgeSurface;
use undertow_retrieval::{RetrievalConfig, RetrievalEngine};

fn state(repo: &MemoryTaskRepository) -> AppState {
    let engine = Arc::new(RetrievalEngine::new(
        Arc::new(MockGenerationBackend::new()),
        Arc::new(MockGenerationBackend::new()),
        Arc::new(MockKnowledgeSurface::new()),
        RetrievalConfig::default(),
    ));
    let repo: Arc<dyn TaskRepository> = Arc::new(repo.clone());
    let (events, _) = broadcast::channel(16);
    AppState::new(repo.clone(), Dispatcher::new(repo, engine), events)
}

async fn send(repo: &MemoryTaskRepository, request: Request<Body>) -> (StatusCode, Value) {
    let response = router(state(repo)).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let repo = MemoryTaskRepository::new();
    let (status, body) = send(&repo, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_create_and_get_task() {
    let repo = MemoryTaskRepository::new();
    let (status, body) = send(
        &repo,
        post_json(
            "/api/v1/tasks",
            json!({
                "objective": "pricing history",
                "user_id": "u1",
                "conversation_id": "c1",
                "priority": "high"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["id"].as_str().unwrap().to_string();

    let (status, task) = send(&repo, get(&format!("/api/v1/tasks/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["status"], "pending");
    assert_eq!(task["objective"], "pricing history");
}

#[tokio::test]
async fn test_unknown_task_is_404() {
    let repo = MemoryTaskRepository::new();
    let (status, body) = send(
        &repo,
        get("/api/v1/tasks/018f0000-0000-7000-8000-000000000000"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn test_blank_objective_rejected() {
    let repo = MemoryTaskRepository::new();
    let (status, _) = send(
        &repo,
        post_json(
            "/api/v1/tasks",
            json!({"objective": "  ", "user_id": "u1", "conversation_id": "c1"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(repo.queue_stats().await.unwrap().total, 0);
}

#[tokio::test]
async fn test_dispatch_quick_query() {
    let repo = MemoryTaskRepository::new();
    let (status, body) = send(
        &repo,
        post_json(
            "/api/v1/retrieval/dispatch",
            json!({
                "objective": "what is the capital of France",
                "user_id": "u1",
                "conversation_id": "c1"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["depth"], "quick");
    assert_eq!(body["scheduled"], false);
    assert_eq!(repo.queue_stats().await.unwrap().total, 0);
}

#[tokio::test]
async fn test_resurface_returns_reportable_only() {
    let repo = MemoryTaskRepository::new();

    let reportable = repo
        .enqueue(NewTask::new("pricing", "u1", "c1"))
        .await
        .unwrap();
    let empty = repo
        .enqueue(NewTask::new("small talk", "u1", "c1"))
        .await
        .unwrap();

    let mut record = ResurfaceRecord::empty();
    record.summary = "I also found the March pricing decision.".into();
    record.total_findings = 2;
    record.confidence = 0.7;

    for _ in 0..2 {
        let task = repo.claim_next().await.unwrap().unwrap();
        if task.id == reportable {
            repo.complete(task.id, &record, 10).await.unwrap();
        } else {
            repo.complete(task.id, &ResurfaceRecord::empty(), 10)
                .await
                .unwrap();
        }
    }

    let (status, body) = send(&repo, get("/api/v1/conversations/c1/resurface?since=1h")).await;
    assert_eq!(status, StatusCode::OK);
    let items = body.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["task_id"], reportable.to_string());
    assert_ne!(items[0]["task_id"], empty.to_string());
    assert_eq!(
        items[0]["record"]["summary"],
        "I also found the March pricing decision."
    );

    let (status, body) = send(&repo, get("/api/v1/conversations/c2/resurface")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_resurface_invalid_since() {
    let repo = MemoryTaskRepository::new();
    let (status, _) = send(
        &repo,
        get("/api/v1/conversations/c1/resurface?since=whenever"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_queue_stats() {
    let repo = MemoryTaskRepository::new();
    repo.enqueue(NewTask::new("a", "u1", "c1")).await.unwrap();
    repo.enqueue(NewTask::new("b", "u1", "c1")).await.unwrap();
    let claimed = repo.claim_next().await.unwrap().unwrap();
    repo.fail(claimed.id, "boom").await.unwrap();

    let (status, body) = send(&repo, get("/api/v1/queue/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pending"], 1);
    assert_eq!(body["failed"], 1);
    assert_eq!(body["total"], 2);
}
