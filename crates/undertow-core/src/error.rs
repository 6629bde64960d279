//! Error types for undertow.

use thiserror::Error;
use uuid::Uuid;

use crate::models::TaskStatus;

/// Result type alias using undertow's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for undertow operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Task not found
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// A task state change that the lifecycle does not allow
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Inference/generation failed
    #[error("Inference error: {0}")]
    Inference(String),

    /// Knowledge surface call failed
    #[error("Knowledge error: {0}")]
    Knowledge(String),

    /// Retrieval plan could not be parsed or executed
    #[error("Plan error: {0}")]
    Plan(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Feature switched off by configuration
    #[error("Disabled: {0}")]
    Disabled(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}
