//! Knowledge capabilities bound to one retrieval scope.
//!
//! This is the only surface a plan can reach. Every call carries the
//! owner scope; limits are clamped before they reach the knowledge service.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::trace;
use undertow_core::{
    defaults, parse_time_expression, resolve_since, Finding, GrepOptions, KnowledgeSurface,
    Result, RetrievalScope, SemanticSearchOptions, TimeRange,
};

/// Capability functions closed over a [`RetrievalScope`].
#[derive(Clone)]
pub struct ScopedCapabilities {
    surface: Arc<dyn KnowledgeSurface>,
    scope: RetrievalScope,
}

impl ScopedCapabilities {
    pub fn new(surface: Arc<dyn KnowledgeSurface>, scope: RetrievalScope) -> Self {
        Self { surface, scope }
    }

    pub fn scope(&self) -> &RetrievalScope {
        &self.scope
    }

    pub async fn semantic_search(
        &self,
        query: &str,
        limit: Option<usize>,
        threshold: Option<f32>,
    ) -> Result<Vec<Finding>> {
        let options = SemanticSearchOptions {
            limit: clamp_limit(limit, defaults::SEMANTIC_SEARCH_LIMIT),
            threshold: threshold
                .filter(|t| t.is_finite())
                .map(|t| t.clamp(0.0, 1.0))
                .unwrap_or(defaults::SEMANTIC_SEARCH_THRESHOLD),
        };
        trace!(op = "semantic_search", query, limit = options.limit, "Capability call");
        self.surface
            .semantic_search(&self.scope, query, options)
            .await
    }

    pub async fn keyword_grep(
        &self,
        pattern: &str,
        case_sensitive: Option<bool>,
        limit: Option<usize>,
    ) -> Result<Vec<Finding>> {
        let options = GrepOptions {
            case_sensitive: case_sensitive.unwrap_or(false),
            limit: clamp_limit(limit, defaults::GREP_LIMIT),
        };
        trace!(op = "keyword_grep", pattern, limit = options.limit, "Capability call");
        self.surface.keyword_grep(&self.scope, pattern, options).await
    }

    pub async fn get_connected(&self, finding_id: &str) -> Result<Vec<Finding>> {
        trace!(op = "get_connected", finding_id, "Capability call");
        self.surface.get_connected(&self.scope, finding_id).await
    }

    pub async fn get_nodes(&self, ids: &[String]) -> Result<Vec<Finding>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = &ids[..ids.len().min(defaults::CAPABILITY_MAX_LIMIT)];
        trace!(op = "get_nodes", count = ids.len(), "Capability call");
        self.surface.get_nodes(&self.scope, ids).await
    }

    /// `since` and `until` accept ISO-8601 or relative phrases. An unparseable
    /// `since` falls back to seven days ago; an unparseable `until` is dropped.
    pub async fn search_by_time(
        &self,
        since: Option<&str>,
        until: Option<&str>,
        query: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Finding>> {
        let now = Utc::now();
        let range = TimeRange {
            since: resolve_since(since, now),
            until: until.and_then(|u| parse_time_expression(u, now)),
            query: query
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(str::to_string),
            limit: clamp_limit(limit, defaults::TIME_SEARCH_LIMIT),
        };
        trace!(op = "search_by_time", since = %range.since, "Capability call");
        self.surface.search_by_time(&self.scope, range).await
    }

    /// Keep the first occurrence of each source id. Findings without an id are
    /// kept as-is.
    pub fn dedupe(findings: Vec<Finding>) -> Vec<Finding> {
        let mut seen = HashSet::new();
        findings
            .into_iter()
            .filter(|f| f.source_id.is_empty() || seen.insert(f.source_id.clone()))
            .collect()
    }
}

fn clamp_limit(limit: Option<usize>, default: usize) -> usize {
    limit
        .filter(|&l| l > 0)
        .unwrap_or(default)
        .min(defaults::CAPABILITY_MAX_LIMIT)
}
