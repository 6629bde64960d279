//! # undertow-core
//!
//! Core types, traits, and abstractions for the undertow deep retrieval system.
//!
//! This crate provides the foundational data structures (tasks, findings,
//! clusters) and the trait seams (task store, knowledge surface, generation
//! backend) that the other undertow crates depend on.

pub mod defaults;
pub mod error;
pub mod models;
pub mod temporal;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use temporal::{parse_time_expression, resolve_since};
pub use traits::*;

/// Generate a new time-ordered (v7) UUID.
pub fn new_v7() -> uuid::Uuid {
    uuid::Uuid::now_v7()
}
