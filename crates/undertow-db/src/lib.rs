//! # undertow-db
//!
//! Task queue persistence for undertow deep retrieval.
//!
//! This crate provides:
//! - Connection pool management
//! - [`PgTaskRepository`]: PostgreSQL queue with `FOR UPDATE SKIP LOCKED` claims
//!   and status-guarded terminal writes
//! - [`MemoryTaskRepository`]: the same contract in process, for tests and
//!   single-node runs
//!
//! ## Example
//!
//! ```rust,ignore
//! use undertow_db::{Database, NewTask, TaskRepository};
//!
//! let db = Database::connect("postgres://localhost/undertow").await?;
//! let id = db.tasks.enqueue(NewTask::new("pricing history", "u1", "c1")).await?;
//! ```

pub mod memory;
pub mod pool;
pub mod tasks;

pub mod test_fixtures;

pub use undertow_core::*;

pub use memory::MemoryTaskRepository;
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use tasks::PgTaskRepository;

/// Database context: the pool plus the task repository.
pub struct Database {
    pub pool: sqlx::Pool<sqlx::Postgres>,
    pub tasks: PgTaskRepository,
}

impl Database {
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            tasks: PgTaskRepository::new(pool.clone()),
            pool,
        }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
