//! HTTP routes: task intake, task lookup, resurfacing reads and the event stream.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info};
use uuid::Uuid;

use undertow_core::{
    defaults, parse_time_expression, Error, NewTask, ResurfaceRecord, TaskRepository,
};
use undertow_jobs::{Dispatch, Dispatcher, WorkerEvent};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn TaskRepository>,
    pub dispatcher: Dispatcher,
    pub events: broadcast::Sender<WorkerEvent>,
}

impl AppState {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        dispatcher: Dispatcher,
        events: broadcast::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            repo,
            dispatcher,
            events,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/retrieval/dispatch", post(dispatch_retrieval))
        .route("/api/v1/tasks", post(create_task))
        .route("/api/v1/tasks/:id", get(get_task))
        .route(
            "/api/v1/conversations/:conversation_id/resurface",
            get(list_resurface),
        )
        .route("/api/v1/queue/stats", get(queue_stats))
        .route("/api/v1/events", get(sse_events))
        .with_state(state)
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug)]
pub enum ApiError {
    Internal(Error),
    NotFound(String),
    BadRequest(String),
    Unavailable(String),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::TaskNotFound(id) => ApiError::NotFound(format!("Task {} not found", id)),
            Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            Error::Disabled(msg) => ApiError::Unavailable(msg),
            other => ApiError::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Internal(err) => {
                error!(error = %err, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

fn validate(request: &NewTask) -> Result<(), ApiError> {
    if request.objective.trim().is_empty() {
        return Err(ApiError::BadRequest("objective must not be empty".into()));
    }
    if request.user_id.trim().is_empty() {
        return Err(ApiError::BadRequest("user_id must not be empty".into()));
    }
    if request.conversation_id.trim().is_empty() {
        return Err(ApiError::BadRequest("conversation_id must not be empty".into()));
    }
    Ok(())
}

// =============================================================================
// HANDLERS
// =============================================================================

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DispatchResponse {
    /// `None` when deep retrieval is disabled.
    pub depth: Option<String>,
    /// Whether a background decision was started.
    pub scheduled: bool,
}

/// Foreground entry point. Returns as soon as the query is classified.
async fn dispatch_retrieval(
    State(state): State<AppState>,
    Json(request): Json<NewTask>,
) -> Result<impl IntoResponse, ApiError> {
    validate(&request)?;

    let outcome = state.dispatcher.dispatch(request);
    let response = DispatchResponse {
        depth: outcome.depth().map(|d| d.to_string()),
        scheduled: matches!(outcome, Dispatch::Scheduled { .. }),
    };
    // Dropping the join handle detaches the background decision.
    drop(outcome);

    Ok((StatusCode::ACCEPTED, Json(response)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTaskResponse {
    pub id: Uuid,
}

/// Enqueue directly. Without a plan the worker runs the decision itself.
async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<NewTask>,
) -> Result<impl IntoResponse, ApiError> {
    validate(&request)?;
    let id = state.dispatcher.enqueue(request).await?;
    info!(task_id = %id, "Task enqueued via API");
    Ok((StatusCode::CREATED, Json(CreateTaskResponse { id })))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .repo
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", id)))?;
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
pub struct ResurfaceQuery {
    /// ISO-8601 timestamp or relative phrase ("1h", "yesterday").
    pub since: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResurfaceItem {
    pub task_id: Uuid,
    pub objective: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub record: ResurfaceRecord,
}

/// Completed, reportable records for a conversation, oldest first.
async fn list_resurface(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<ResurfaceQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let since = match query.since.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => Some(
            parse_time_expression(s, Utc::now())
                .ok_or_else(|| ApiError::BadRequest(format!("Invalid since: {}", s)))?,
        ),
        None => None,
    };
    let limit = query
        .limit
        .unwrap_or(defaults::RESURFACE_PAGE_LIMIT)
        .clamp(1, 100);

    let tasks = state
        .repo
        .list_resurfaceable(&conversation_id, since, limit)
        .await?;

    let items: Vec<ResurfaceItem> = tasks
        .into_iter()
        .filter_map(|task| {
            let record = task.result?;
            Some(ResurfaceItem {
                task_id: task.id,
                objective: task.objective,
                completed_at: task.completed_at,
                record,
            })
        })
        .collect();

    Ok(Json(items))
}

async fn queue_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.repo.queue_stats().await?))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub conversation_id: Option<String>,
}

/// Whether an event should be pushed to resurfacing clients.
fn is_resurface_event(event: &WorkerEvent, conversation: Option<&str>) -> bool {
    match event {
        WorkerEvent::TaskCompleted {
            conversation_id,
            reportable: true,
            ..
        } => conversation.map_or(true, |c| c == conversation_id),
        _ => false,
    }
}

/// SSE stream of reportable task completions.
///
/// Clients connect to `/api/v1/events` (optionally `?conversation_id=`) and then
/// fetch the records through the resurface endpoint.
async fn sse_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let conversation = query.conversation_id;

    use tokio_stream::StreamExt as _;
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(move |result| {
        match result {
            Ok(event) if is_resurface_event(&event, conversation.as_deref()) => {
                match serde_json::to_string(&event) {
                    Ok(json) => Some(Ok(Event::default().event("task_completed").data(json))),
                    Err(_) => None,
                }
            }
            // Skip other events and lagged errors
            _ => None,
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(conversation_id: &str, reportable: bool) -> WorkerEvent {
        WorkerEvent::TaskCompleted {
            task_id: Uuid::nil(),
            conversation_id: conversation_id.into(),
            duration_ms: 5,
            reportable,
        }
    }

    #[test]
    fn test_resurface_event_filter() {
        assert!(is_resurface_event(&completed("c1", true), None));
        assert!(is_resurface_event(&completed("c1", true), Some("c1")));
        assert!(!is_resurface_event(&completed("c1", true), Some("c2")));
        assert!(!is_resurface_event(&completed("c1", false), None));
        assert!(!is_resurface_event(
            &WorkerEvent::TaskFailed {
                task_id: Uuid::nil(),
                conversation_id: "c1".into(),
                error: "x".into(),
            },
            None
        ));
        assert!(!is_resurface_event(&WorkerEvent::WorkerStarted, None));
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            ApiError::from(Error::TaskNotFound(Uuid::nil())),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(Error::InvalidInput("x".into())),
            ApiError::BadRequest(_)
        ));
        assert!(matches!(
            ApiError::from(Error::Disabled("x".into())),
            ApiError::Unavailable(_)
        ));
        assert!(matches!(
            ApiError::from(Error::Internal("x".into())),
            ApiError::Internal(_)
        ));
    }

    #[test]
    fn test_validate() {
        assert!(validate(&NewTask::new("pricing", "u1", "c1")).is_ok());
        assert!(validate(&NewTask::new("  ", "u1", "c1")).is_err());
        assert!(validate(&NewTask::new("pricing", "", "c1")).is_err());
        assert!(validate(&NewTask::new("pricing", "u1", " ")).is_err());
    }
}
