//! In-memory knowledge surface for deterministic tests.
//!
//! Serves a fixed corpus. Semantic search returns scored findings at or above
//! the threshold in corpus order; keyword grep is a substring match; expansion
//! follows each finding's `connected_ids`. Every call is logged with its scope.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use undertow_core::{
    Error, Finding, GrepOptions, KnowledgeSurface, Result, RetrievalScope,
    SemanticSearchOptions, TimeRange,
};

#[derive(Debug, Default)]
struct CallLog {
    ops: Vec<&'static str>,
    scopes: Vec<RetrievalScope>,
    time_ranges: Vec<TimeRange>,
}

/// Scripted [`KnowledgeSurface`].
#[derive(Clone, Default)]
pub struct MockKnowledgeSurface {
    corpus: Arc<Vec<Finding>>,
    latency: Duration,
    failure: Option<String>,
    log: Arc<Mutex<CallLog>>,
}

impl MockKnowledgeSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_findings(mut self, findings: Vec<Finding>) -> Self {
        self.corpus = Arc::new(findings);
        self
    }

    /// Delay applied to every call; honours `tokio::time::pause`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail every call with `message`.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    fn lock(&self) -> MutexGuard<'_, CallLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Operation names in call order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().ops.clone()
    }

    pub fn scopes(&self) -> Vec<RetrievalScope> {
        self.lock().scopes.clone()
    }

    /// Resolved ranges passed to `search_by_time`.
    pub fn time_ranges(&self) -> Vec<TimeRange> {
        self.lock().time_ranges.clone()
    }

    async fn enter(&self, op: &'static str, scope: &RetrievalScope) -> Result<()> {
        {
            let mut log = self.lock();
            log.ops.push(op);
            log.scopes.push(scope.clone());
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match &self.failure {
            Some(message) => Err(Error::Knowledge(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl KnowledgeSurface for MockKnowledgeSurface {
    async fn semantic_search(
        &self,
        scope: &RetrievalScope,
        _query: &str,
        options: SemanticSearchOptions,
    ) -> Result<Vec<Finding>> {
        self.enter("semantic_search", scope).await?;
        Ok(self
            .corpus
            .iter()
            .filter(|f| f.similarity.is_some_and(|s| s >= options.threshold))
            .take(options.limit)
            .cloned()
            .collect())
    }

    async fn keyword_grep(
        &self,
        scope: &RetrievalScope,
        pattern: &str,
        options: GrepOptions,
    ) -> Result<Vec<Finding>> {
        self.enter("keyword_grep", scope).await?;
        let needle = if options.case_sensitive {
            pattern.to_string()
        } else {
            pattern.to_lowercase()
        };
        Ok(self
            .corpus
            .iter()
            .filter(|f| {
                if options.case_sensitive {
                    f.content.contains(&needle)
                } else {
                    f.content.to_lowercase().contains(&needle)
                }
            })
            .take(options.limit)
            .cloned()
            .collect())
    }

    async fn get_connected(
        &self,
        scope: &RetrievalScope,
        finding_id: &str,
    ) -> Result<Vec<Finding>> {
        self.enter("get_connected", scope).await?;
        let connected = self
            .corpus
            .iter()
            .find(|f| f.source_id == finding_id)
            .and_then(|f| f.connected_ids.clone())
            .unwrap_or_default();
        Ok(self
            .corpus
            .iter()
            .filter(|f| connected.contains(&f.source_id))
            .cloned()
            .collect())
    }

    async fn get_nodes(&self, scope: &RetrievalScope, ids: &[String]) -> Result<Vec<Finding>> {
        self.enter("get_nodes", scope).await?;
        Ok(ids
            .iter()
            .filter_map(|id| self.corpus.iter().find(|f| &f.source_id == id))
            .cloned()
            .collect())
    }

    async fn search_by_time(
        &self,
        scope: &RetrievalScope,
        range: TimeRange,
    ) -> Result<Vec<Finding>> {
        self.enter("search_by_time", scope).await?;
        let limit = range.limit;
        self.lock().time_ranges.push(range);
        Ok(self.corpus.iter().take(limit).cloned().collect())
    }
}
