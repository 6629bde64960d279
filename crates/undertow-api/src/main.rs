//! undertow-api - HTTP API server and worker pool for undertow deep retrieval

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Notify;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use undertow_api::{router, telemetry, ApiConfig, AppState, TaskStore};
use undertow_core::{GenerationBackend, TaskRepository};
use undertow_db::{log_pool_metrics, Database, MemoryTaskRepository, PoolConfig};
use undertow_inference::OllamaBackend;
use undertow_jobs::{DeepRetrievalHandler, Dispatcher, WorkerBuilder, WorkerConfig};
use undertow_retrieval::{HttpKnowledgeSurface, RetrievalConfig, RetrievalEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let _file_guard = telemetry::init_tracing();

    let config = ApiConfig::from_env();

    let (repo, wake) = open_task_store(&config).await?;
    let (fast, capable) = generation_backends()?;
    check_backend(capable.as_ref(), "capable").await;
    if !Arc::ptr_eq(&fast, &capable) {
        check_backend(fast.as_ref(), "fast").await;
    }
    let knowledge = Arc::new(HttpKnowledgeSurface::from_env()?);

    let engine = Arc::new(RetrievalEngine::new(
        fast,
        capable,
        knowledge,
        RetrievalConfig::from_env(),
    ));

    let worker = WorkerBuilder::new(repo.clone())
        .with_config(WorkerConfig::from_env())
        .with_handler(DeepRetrievalHandler::new(engine.clone()))
        .with_wake(wake)
        .build()?;
    let events = worker.event_bus();
    let worker_handle = worker.start();

    let state = AppState::new(repo.clone(), Dispatcher::new(repo, engine), events);
    let app = router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = config.bind_addr().parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = worker_handle.shutdown().await {
        warn!(error = %e, "Worker already stopped");
    }
    info!("Server stopped");

    Ok(())
}

async fn open_task_store(
    config: &ApiConfig,
) -> anyhow::Result<(Arc<dyn TaskRepository>, Arc<Notify>)> {
    match config.task_store {
        TaskStore::Postgres => {
            let db = Database::connect_with_config(&config.database_url, PoolConfig::from_env())
                .await?;
            db.migrate().await?;
            log_pool_metrics(db.pool());
            info!("Task store: postgres");
            let wake = db.tasks.task_notify();
            Ok((Arc::new(db.tasks), wake))
        }
        TaskStore::Memory => {
            warn!("Task store: memory (tasks are lost on restart)");
            let repo = MemoryTaskRepository::new();
            let wake = repo.task_notify();
            Ok((Arc::new(repo), wake))
        }
    }
}

/// `(fast, capable)` generation backends. The fast tier falls back to the
/// capable one when `UNDERTOW_FAST_GEN_MODEL` is set to an empty string.
fn generation_backends() -> anyhow::Result<(Arc<dyn GenerationBackend>, Arc<dyn GenerationBackend>)> {
    #[cfg(feature = "openai")]
    {
        if std::env::var("INFERENCE_BACKEND").as_deref() == Ok("openai") {
            let backend: Arc<dyn GenerationBackend> =
                Arc::new(undertow_inference::OpenAIBackend::from_env()?);
            info!(model = backend.model_name(), "Generation backend: openai");
            return Ok((backend.clone(), backend));
        }
    }

    let capable: Arc<dyn GenerationBackend> = Arc::new(OllamaBackend::from_env());
    let fast: Arc<dyn GenerationBackend> = match OllamaBackend::fast_from_env() {
        Some(backend) => Arc::new(backend),
        None => capable.clone(),
    };
    info!(
        capable_model = capable.model_name(),
        fast_model = fast.model_name(),
        "Generation backend: ollama"
    );
    Ok((fast, capable))
}

/// Startup probe. An unreachable backend is logged, not fatal: tasks that need
/// it fail individually and the queue keeps serving.
async fn check_backend(backend: &dyn GenerationBackend, tier: &str) {
    match backend.health_check().await {
        Ok(true) => info!(tier, model = backend.model_name(), "Generation backend reachable"),
        Ok(false) => warn!(tier, model = backend.model_name(), "Generation backend not responding"),
        Err(e) => warn!(tier, model = backend.model_name(), error = %e, "Generation backend health check failed"),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
