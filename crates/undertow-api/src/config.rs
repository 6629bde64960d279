//! Server configuration from the environment.

use undertow_core::defaults;

/// Where tasks are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStore {
    Postgres,
    /// In-process queue; tasks do not survive a restart.
    Memory,
}

impl TaskStore {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Some(Self::Postgres),
            "memory" | "mem" => Some(Self::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub task_store: TaskStore,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/undertow".to_string(),
            host: "0.0.0.0".to_string(),
            port: defaults::SERVER_PORT,
            task_store: TaskStore::Postgres,
        }
    }
}

impl ApiConfig {
    /// | Variable | Default |
    /// |----------|---------|
    /// | `DATABASE_URL` | `postgres://localhost/undertow` |
    /// | `HOST` | `0.0.0.0` |
    /// | `PORT` | `3000` |
    /// | `TASK_STORE` | `postgres` (or `memory`) |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            task_store: std::env::var("TASK_STORE")
                .ok()
                .and_then(|v| TaskStore::parse(&v))
                .unwrap_or(defaults.task_store),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
