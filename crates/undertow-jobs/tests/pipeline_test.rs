//! Worker + deep retrieval handler end to end, against in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use undertow_core::{
    ConversationContext, Finding, NewTask, ResurfaceRecord, TaskRepository, TaskStatus,
};
use undertow_db::MemoryTaskRepository;
use undertow_inference::mock::MockGenerationBackend;
use undertow_jobs::{DeepRetrievalHandler, Dispatch, Dispatcher, WorkerBuilder, WorkerConfig, WorkerEvent};
use undertow_retrieval::mock::MockKnowledgeSurface;
use undertow_retrieval::{RetrievalConfig, RetrievalEngine};

const PLAN: &str = r#"{"steps":[
    {"op":"semantic_search","query":"pricing","into":"hits"},
    {"op":"return","from":"hits","confidence":0.8}
]}"#;

const STRATEGY_NEEDLE: &str = "retrieval plan as JSON";
const SYNTHESIS_NEEDLE: &str = "background search just finished";

fn corpus() -> MockKnowledgeSurface {
    MockKnowledgeSurface::new().with_findings(vec![
        Finding::new("n1", "Per-seat pricing approved in March").with_similarity(0.92),
        Finding::new("n2", "Annual discount dropped after finance review").with_similarity(0.81),
        Finding::new("n3", "Enterprise tier kept flat pricing").with_similarity(0.64),
    ])
}

fn capable() -> MockGenerationBackend {
    MockGenerationBackend::new()
        .with_response_mapping(STRATEGY_NEEDLE, PLAN)
        .with_response_mapping(
            SYNTHESIS_NEEDLE,
            "Oh, I also found that per-seat pricing was approved back in March.",
        )
}

fn engine(
    fast: MockGenerationBackend,
    capable: MockGenerationBackend,
    knowledge: MockKnowledgeSurface,
) -> Arc<RetrievalEngine> {
    Arc::new(RetrievalEngine::new(
        Arc::new(fast),
        Arc::new(capable),
        Arc::new(knowledge),
        RetrievalConfig::default(),
    ))
}

fn start_worker(
    repo: &MemoryTaskRepository,
    engine: Arc<RetrievalEngine>,
) -> (undertow_jobs::WorkerHandle, broadcast::Receiver<WorkerEvent>) {
    let worker = WorkerBuilder::new(Arc::new(repo.clone()))
        .with_config(WorkerConfig::default().with_poll_interval(10))
        .with_handler(DeepRetrievalHandler::new(engine))
        .with_wake(repo.task_notify())
        .build()
        .unwrap();
    let events = worker.events();
    (worker.start(), events)
}

async fn wait_terminal(events: &mut broadcast::Receiver<WorkerEvent>, limit: Duration) -> WorkerEvent {
    tokio::time::timeout(limit, async {
        loop {
            match events.recv().await {
                Ok(event @ WorkerEvent::TaskCompleted { .. })
                | Ok(event @ WorkerEvent::TaskFailed { .. }) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream closed: {}", e),
            }
        }
    })
    .await
    .expect("task never reached a terminal state")
}

#[tokio::test]
async fn test_task_with_plan_completes_and_resurfaces() {
    let repo = MemoryTaskRepository::new();
    let capable = capable();
    let (_handle, mut events) = start_worker(
        &repo,
        engine(MockGenerationBackend::new(), capable.clone(), corpus()),
    );

    let id = repo
        .enqueue(NewTask::new("pricing history", "u1", "c1").with_plan(PLAN))
        .await
        .unwrap();

    let event = wait_terminal(&mut events, Duration::from_secs(5)).await;
    assert!(matches!(event, WorkerEvent::TaskCompleted { reportable: true, .. }));

    let task = repo.get(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Complete);
    let record = task.result.unwrap();
    assert_eq!(record.total_findings, 3);
    assert!((record.confidence - 0.8).abs() < 1e-6);
    assert!(record.summary.contains("per-seat pricing"));

    // Plan supplied: no strategy call, fast-path clustering, one synthesis call.
    assert_eq!(capable.calls_mentioning(STRATEGY_NEEDLE), 0);
    assert_eq!(capable.call_count(), 1);

    let resurfaced = repo.list_resurfaceable("c1", None, 20).await.unwrap();
    assert_eq!(resurfaced.len(), 1);
    assert_eq!(resurfaced[0].id, id);
}

#[tokio::test]
async fn test_task_without_plan_decides_inline() {
    let repo = MemoryTaskRepository::new();
    let fast = MockGenerationBackend::new().with_fixed_response("NO");
    let capable = capable();
    let (_handle, mut events) = start_worker(
        &repo,
        engine(fast.clone(), capable.clone(), corpus()),
    );

    let id = repo
        .enqueue(NewTask::new(
            "give me the full timeline of all pricing decisions and trade-offs we discussed",
            "u1",
            "c1",
        ))
        .await
        .unwrap();

    wait_terminal(&mut events, Duration::from_secs(5)).await;
    let task = repo.get(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Complete);
    assert!(task.result.unwrap().is_reportable());
    // Comprehensive: the gate is bypassed.
    assert_eq!(fast.call_count(), 0);
    assert_eq!(capable.calls_mentioning(STRATEGY_NEEDLE), 1);
}

#[tokio::test]
async fn test_declined_task_completes_empty_and_stays_invisible() {
    let repo = MemoryTaskRepository::new();
    let fast = MockGenerationBackend::new().with_fixed_response("NO. The prefetch already covers it.");
    let capable = capable();
    let (_handle, mut events) = start_worker(
        &repo,
        engine(fast.clone(), capable.clone(), corpus()),
    );

    let id = repo
        .enqueue(NewTask::new(
            "remind me where we landed on seat pricing with finance",
            "u1",
            "c1",
        ))
        .await
        .unwrap();

    let event = wait_terminal(&mut events, Duration::from_secs(5)).await;
    assert!(matches!(event, WorkerEvent::TaskCompleted { reportable: false, .. }));

    let task = repo.get(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Complete);
    assert_eq!(task.result, Some(ResurfaceRecord::empty()));
    assert_eq!(fast.call_count(), 1);
    assert_eq!(capable.call_count(), 0);
    assert!(repo.list_resurfaceable("c1", None, 20).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slow_plan_times_out_and_completes_empty() {
    let repo = MemoryTaskRepository::new();
    let capable = capable();
    let slow = corpus().with_latency(Duration::from_secs(40));
    let (_handle, mut events) = start_worker(
        &repo,
        engine(MockGenerationBackend::new(), capable.clone(), slow),
    );

    let id = repo
        .enqueue(NewTask::new("pricing history", "u1", "c1").with_plan(PLAN))
        .await
        .unwrap();

    let event = wait_terminal(&mut events, Duration::from_secs(120)).await;
    assert!(matches!(event, WorkerEvent::TaskCompleted { reportable: false, .. }));

    let task = repo.get(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Complete);
    let record = task.result.unwrap();
    assert!(record.unclustered.is_empty() && record.clusters.is_empty());
    assert_eq!(record.confidence, 0.0);
    // Synthesis skipped.
    assert_eq!(capable.call_count(), 0);
}

#[tokio::test]
async fn test_dispatch_then_worker() {
    let repo = MemoryTaskRepository::new();
    let capable = capable();
    let engine = engine(MockGenerationBackend::new(), capable.clone(), corpus());
    let dispatcher = Dispatcher::new(Arc::new(repo.clone()), engine.clone());
    let (_handle, mut events) = start_worker(&repo, engine);

    let request = NewTask::new(
        "dig up everything we said about pricing tiers and discounts",
        "u1",
        "c9",
    )
    .with_context(ConversationContext {
        recent_turns: vec!["We went over seat pricing.".into()],
        ..Default::default()
    });
    let Dispatch::Scheduled { handle, .. } = dispatcher.dispatch(request) else {
        panic!("expected scheduled dispatch");
    };
    let id = handle.await.unwrap().unwrap().expect("task enqueued");

    wait_terminal(&mut events, Duration::from_secs(5)).await;
    let resurfaced = repo.list_resurfaceable("c9", None, 20).await.unwrap();
    assert_eq!(resurfaced.len(), 1);
    assert_eq!(resurfaced[0].id, id);
    // Strategy once at dispatch; the worker reuses the stored plan.
    assert_eq!(capable.calls_mentioning(STRATEGY_NEEDLE), 1);
}
