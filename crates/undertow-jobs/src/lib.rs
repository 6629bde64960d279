//! # undertow-jobs
//!
//! Background processing for deep retrieval tasks.
//!
//! - [`TaskWorker`]: claims tasks from a [`TaskRepository`], runs them
//!   concurrently and writes exactly one terminal state per task
//! - [`TaskHandler`]: the unit of work a worker runs for each claimed task
//! - [`DeepRetrievalHandler`]: the full decide/execute/cluster/synthesize pipeline
//! - [`Dispatcher`]: non-blocking foreground entry point
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use undertow_jobs::{DeepRetrievalHandler, WorkerBuilder, WorkerConfig};
//!
//! let worker = WorkerBuilder::new(repo)
//!     .with_config(WorkerConfig::from_env())
//!     .with_handler(DeepRetrievalHandler::new(engine.clone()))
//!     .build()?;
//!
//! let handle = worker.start();
//! // ...
//! handle.shutdown().await?;
//! ```

pub mod deep_retrieval;
pub mod dispatch;
pub mod handler;
pub mod worker;

pub use undertow_core::*;

pub use deep_retrieval::DeepRetrievalHandler;
pub use dispatch::{Dispatch, Dispatcher};
pub use handler::{NoOpHandler, TaskContext, TaskHandler, TaskResult};
pub use worker::{TaskWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle};
