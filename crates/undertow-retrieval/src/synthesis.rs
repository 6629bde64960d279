//! Conversational follow-up from clustered findings.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};
use undertow_core::{defaults, ClusteredResult, GenerationBackend, GenerationRequest};

use crate::prompts::{excerpt, synthesis_user_prompt, SYNTHESIS_SYSTEM_PROMPT};

/// Turns a [`ClusteredResult`] into a short follow-up utterance.
pub struct Synthesizer {
    backend: Arc<dyn GenerationBackend>,
}

impl Synthesizer {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self { backend }
    }

    /// Empty when there is nothing to report. Otherwise always non-empty:
    /// model failures fall back to [`fallback_summary`].
    pub async fn synthesize(
        &self,
        clustered: &ClusteredResult,
        query: &str,
        recent_turns: &[String],
    ) -> String {
        if clustered.total_findings == 0 {
            return String::new();
        }
        let start = Instant::now();

        let request = GenerationRequest::new(
            SYNTHESIS_SYSTEM_PROMPT,
            synthesis_user_prompt(query, &build_digest(clustered), recent_turns),
        )
        .with_temperature(defaults::SYNTHESIS_TEMPERATURE)
        .with_max_tokens(defaults::SYNTHESIS_MAX_TOKENS);

        match self.backend.invoke(request).await {
            Ok(response) => {
                let text = clean_reply(&response.text);
                if text.is_empty() {
                    warn!(
                        subsystem = "retrieval",
                        component = "synthesis",
                        "Empty synthesis reply, using template"
                    );
                    return fallback_summary(clustered);
                }
                debug!(
                    subsystem = "retrieval",
                    component = "synthesis",
                    response_len = text.len(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Synthesis complete"
                );
                text
            }
            Err(e) => {
                warn!(
                    subsystem = "retrieval",
                    component = "synthesis",
                    error = %e,
                    "Synthesis failed, using template"
                );
                fallback_summary(clustered)
            }
        }
    }
}

/// Compact digest: theme, summary and one representative excerpt per cluster,
/// plus a count of unclustered items.
pub fn build_digest(clustered: &ClusteredResult) -> String {
    let mut digest = String::new();
    for cluster in &clustered.clusters {
        digest.push_str(&format!(
            "Theme: {} ({} items)\n",
            cluster.theme,
            cluster.findings.len()
        ));
        if !cluster.summary.is_empty() {
            digest.push_str(&format!("Summary: {}\n", cluster.summary));
        }
        if let Some(rep) = cluster.representative() {
            digest.push_str(&format!("Example: {}\n", excerpt(&rep.content)));
        }
        digest.push('\n');
    }
    if !clustered.unclustered.is_empty() {
        digest.push_str(&format!(
            "Plus {} other loosely related items.\n",
            clustered.unclustered.len()
        ));
    }
    digest
}

/// Deterministic follow-up listing cluster themes and counts.
pub fn fallback_summary(clustered: &ClusteredResult) -> String {
    let total = clustered.total_findings;
    let noun = if total == 1 { "item" } else { "items" };
    if clustered.clusters.is_empty() {
        return format!("I dug up {} more related {} you might want to look at.", total, noun);
    }
    let themes: Vec<String> = clustered
        .clusters
        .iter()
        .map(|c| format!("{} ({})", c.theme, c.findings.len()))
        .collect();
    format!(
        "I dug up {} more related {}, mostly around {}.",
        total,
        noun,
        themes.join(", ")
    )
}

/// Trim whitespace and a wrapping pair of quotes.
fn clean_reply(text: &str) -> String {
    let trimmed = text.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(trimmed);
    unquoted.trim().to_string()
}
