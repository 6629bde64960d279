//! undertow-api - HTTP surface for undertow deep retrieval
//!
//! The binary in `main.rs` wires backends, the task store and the worker pool
//! together; this library holds the pieces that can be exercised in-process.

pub mod config;
pub mod routes;
pub mod telemetry;

pub use config::{ApiConfig, TaskStore};
pub use routes::{router, ApiError, AppState};
