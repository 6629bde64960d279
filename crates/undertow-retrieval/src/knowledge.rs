//! HTTP client for an external knowledge service.
//!
//! Every request is a JSON `POST` carrying the owner scope. Responses are
//! normalized with [`findings_from_value`], so the service may answer with a
//! bare array or an object holding `findings`, `results` or `nodes`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use undertow_core::{
    defaults, Error, Finding, GrepOptions, KnowledgeSurface, Result, RetrievalScope,
    SemanticSearchOptions, TimeRange,
};

use crate::normalize::findings_from_value;

/// Connection settings for the knowledge service.
#[derive(Debug, Clone)]
pub struct KnowledgeServiceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for KnowledgeServiceConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::KNOWLEDGE_URL.to_string(),
            api_key: None,
            timeout_secs: defaults::KNOWLEDGE_TIMEOUT_SECS,
        }
    }
}

impl KnowledgeServiceConfig {
    /// Read `KNOWLEDGE_BASE_URL`, `KNOWLEDGE_API_KEY`, `KNOWLEDGE_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("KNOWLEDGE_BASE_URL").unwrap_or(defaults.base_url),
            api_key: std::env::var("KNOWLEDGE_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            timeout_secs: std::env::var("KNOWLEDGE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.timeout_secs),
        }
    }
}

#[derive(Serialize)]
struct ScopedRequest<'a, T: Serialize> {
    #[serde(flatten)]
    scope: &'a RetrievalScope,
    #[serde(flatten)]
    body: T,
}

/// [`KnowledgeSurface`] backed by the knowledge service's HTTP API.
pub struct HttpKnowledgeSurface {
    client: Client,
    config: KnowledgeServiceConfig,
}

impl HttpKnowledgeSurface {
    pub fn new(config: KnowledgeServiceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Knowledge(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            subsystem = "retrieval",
            component = "knowledge",
            url = %config.base_url,
            timeout_secs = config.timeout_secs,
            "Initializing knowledge service client"
        );

        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(KnowledgeServiceConfig::from_env())
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    #[instrument(skip(self, scope, body), fields(subsystem = "retrieval", component = "knowledge", op = endpoint))]
    async fn post(&self, endpoint: &str, scope: &RetrievalScope, body: Value) -> Result<Vec<Finding>> {
        let start = Instant::now();
        let mut request = self
            .client
            .post(self.url(endpoint))
            .json(&ScopedRequest { scope, body });
        if let Some(ref key) = self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Knowledge(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            warn!(status = %status, "Knowledge service returned an error");
            return Err(Error::Knowledge(format!(
                "Knowledge service returned {}: {}",
                status, text
            )));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| Error::Knowledge(format!("Failed to parse response: {}", e)))?;
        let findings = findings_from_value(&value);

        debug!(
            result_count = findings.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Knowledge call complete"
        );
        Ok(findings)
    }
}

#[async_trait]
impl KnowledgeSurface for HttpKnowledgeSurface {
    async fn semantic_search(
        &self,
        scope: &RetrievalScope,
        query: &str,
        options: SemanticSearchOptions,
    ) -> Result<Vec<Finding>> {
        self.post(
            "/v1/search/semantic",
            scope,
            json!({"query": query, "limit": options.limit, "threshold": options.threshold}),
        )
        .await
    }

    async fn keyword_grep(
        &self,
        scope: &RetrievalScope,
        pattern: &str,
        options: GrepOptions,
    ) -> Result<Vec<Finding>> {
        self.post(
            "/v1/search/keyword",
            scope,
            json!({
                "pattern": pattern,
                "case_sensitive": options.case_sensitive,
                "limit": options.limit
            }),
        )
        .await
    }

    async fn get_connected(
        &self,
        scope: &RetrievalScope,
        finding_id: &str,
    ) -> Result<Vec<Finding>> {
        self.post("/v1/nodes/connected", scope, json!({"id": finding_id}))
            .await
    }

    async fn get_nodes(&self, scope: &RetrievalScope, ids: &[String]) -> Result<Vec<Finding>> {
        self.post("/v1/nodes/batch", scope, json!({"ids": ids}))
            .await
    }

    async fn search_by_time(
        &self,
        scope: &RetrievalScope,
        range: TimeRange,
    ) -> Result<Vec<Finding>> {
        self.post("/v1/search/time", scope, serde_json::to_value(&range)?)
            .await
    }
}
