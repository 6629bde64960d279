//! Retrieval pipeline configuration.

use std::time::Duration;

use tracing::debug;
use undertow_core::defaults;

/// Caps applied by the clustering engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterOptions {
    pub max_clusters: usize,
    pub max_per_cluster: usize,
    pub min_cluster_size: usize,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            max_clusters: defaults::CLUSTER_MAX_CLUSTERS,
            max_per_cluster: defaults::CLUSTER_MAX_PER_CLUSTER,
            min_cluster_size: defaults::CLUSTER_MIN_SIZE,
        }
    }
}

impl ClusterOptions {
    /// Read `CLUSTER_MAX_CLUSTERS`, `CLUSTER_MAX_PER_CLUSTER`, `CLUSTER_MIN_SIZE`.
    ///
    /// Zero values are ignored so a misconfigured cap never discards everything.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_clusters: env_usize("CLUSTER_MAX_CLUSTERS").unwrap_or(defaults.max_clusters),
            max_per_cluster: env_usize("CLUSTER_MAX_PER_CLUSTER")
                .unwrap_or(defaults.max_per_cluster),
            min_cluster_size: env_usize("CLUSTER_MIN_SIZE").unwrap_or(defaults.min_cluster_size),
        }
    }

    pub fn with_max_clusters(mut self, max: usize) -> Self {
        self.max_clusters = max.max(1);
        self
    }

    pub fn with_max_per_cluster(mut self, max: usize) -> Self {
        self.max_per_cluster = max.max(1);
        self
    }

    pub fn with_min_cluster_size(mut self, min: usize) -> Self {
        self.min_cluster_size = min.max(1);
        self
    }
}

/// Configuration for the whole deep retrieval pipeline.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Master switch; when off the dispatcher never enqueues.
    pub enabled: bool,
    pub plan_timeout: Duration,
    pub plan_max_steps: usize,
    pub cluster: ClusterOptions,
    /// Conversation turns shown to the gate and synthesis prompts.
    pub recent_turns_window: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            plan_timeout: Duration::from_secs(defaults::PLAN_TIMEOUT_SECS),
            plan_max_steps: defaults::PLAN_MAX_STEPS,
            cluster: ClusterOptions::default(),
            recent_turns_window: defaults::RECENT_TURNS_WINDOW,
        }
    }
}

impl RetrievalConfig {
    /// Read `DEEP_RETRIEVAL_ENABLED`, `PLAN_TIMEOUT_SECS`, `PLAN_MAX_STEPS` and the
    /// clustering caps.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let enabled = std::env::var("DEEP_RETRIEVAL_ENABLED")
            .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "false" | "0" | "no" | "off"))
            .unwrap_or(defaults.enabled);

        let config = Self {
            enabled,
            plan_timeout: std::env::var("PLAN_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|&v| v > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.plan_timeout),
            plan_max_steps: env_usize("PLAN_MAX_STEPS").unwrap_or(defaults.plan_max_steps),
            cluster: ClusterOptions::from_env(),
            recent_turns_window: defaults.recent_turns_window,
        };

        debug!(
            subsystem = "retrieval",
            component = "config",
            enabled = config.enabled,
            plan_timeout_secs = config.plan_timeout.as_secs(),
            plan_max_steps = config.plan_max_steps,
            "Loaded retrieval configuration"
        );
        config
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_plan_timeout(mut self, timeout: Duration) -> Self {
        self.plan_timeout = timeout;
        self
    }

    pub fn with_plan_max_steps(mut self, max_steps: usize) -> Self {
        self.plan_max_steps = max_steps;
        self
    }

    pub fn with_cluster_options(mut self, cluster: ClusterOptions) -> Self {
        self.cluster = cluster;
        self
    }

    pub fn with_recent_turns_window(mut self, window: usize) -> Self {
        self.recent_turns_window = window;
        self
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|&v| v > 0)
}
