//! Finding clustering.
//!
//! Small result sets take a fast path with no model call. Larger sets are
//! pre-ordered by similarity band, presented to the model by index, and the
//! model's grouping is then post-processed into capped, ranked clusters:
//!
//! 1. Resolve indices to findings; an index is consumed at most once
//! 2. Undersized groups dissolve into `unclustered`
//! 3. Members beyond the per-cluster cap are dropped
//! 4. Representative: first pinned, else highest similarity, else first
//! 5. Confidence: mean member similarity to two decimals, 0.5 when unscored
//! 6. Sort by descending confidence
//! 7. Clusters beyond the cap dissolve into `unclustered`, lowest first
//! 8. Unclaimed findings join `unclustered`
//! 9. `unclustered` is truncated to its ceiling

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use undertow_core::{
    defaults, new_v7, Cluster, ClusterMethod, ClusteredResult, Finding, GenerationBackend,
    GenerationRequest,
};

use crate::config::ClusterOptions;
use crate::prompts::{cluster_system_prompt, cluster_user_prompt, extract_json};

/// Theme used when no model named the group.
pub const DEFAULT_THEME: &str = "Related findings";

/// Score-free confidence default.
const UNSCORED_CONFIDENCE: f32 = 0.5;

/// A group proposed by the model (or the fast path), by presented index.
#[derive(Debug, Clone, PartialEq)]
struct Proposal {
    theme: String,
    summary: String,
    indices: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
struct Assignment {
    proposals: Vec<Proposal>,
    unclustered: Vec<usize>,
    method: ClusterMethod,
}

impl Assignment {
    /// Everything in one group.
    fn catch_all(count: usize) -> Self {
        Self {
            proposals: vec![Proposal {
                theme: DEFAULT_THEME.to_string(),
                summary: String::new(),
                indices: (0..count).collect(),
            }],
            unclustered: Vec::new(),
            method: ClusterMethod::Topic,
        }
    }
}

#[derive(Deserialize)]
struct RawResponse {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    clusters: Vec<RawCluster>,
    #[serde(default)]
    unclustered: Vec<Value>,
}

#[derive(Deserialize)]
struct RawCluster {
    #[serde(default)]
    theme: String,
    #[serde(default)]
    summary: String,
    #[serde(default, rename = "findingIds", alias = "finding_ids", alias = "findings")]
    finding_ids: Vec<Value>,
}

/// Groups findings into themed clusters.
pub struct ClusteringEngine {
    backend: Arc<dyn GenerationBackend>,
    options: ClusterOptions,
}

impl ClusteringEngine {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self {
            backend,
            options: ClusterOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ClusterOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    /// Cluster `findings` for `query`. Never fails; model problems fall back
    /// to a single catch-all group.
    pub async fn cluster(&self, findings: &[Finding], query: &str) -> ClusteredResult {
        if findings.is_empty() {
            return ClusteredResult::empty();
        }
        let start = Instant::now();

        let fast_path = findings.len() < defaults::CLUSTER_FAST_PATH_THRESHOLD;
        let (presented, overflow, assignment) = if fast_path {
            debug!(
                subsystem = "retrieval",
                component = "cluster",
                finding_count = findings.len(),
                "Fast path, skipping model"
            );
            (
                findings.to_vec(),
                Vec::new(),
                Assignment::catch_all(findings.len()),
            )
        } else {
            let mut ordered = order_by_band(findings);
            let overflow = ordered.split_off(ordered.len().min(defaults::CLUSTER_MAX_PRESENTED));
            let assignment = self.refine(&ordered, query).await;
            (ordered, overflow, assignment)
        };

        let result = assemble(presented, overflow, assignment, &self.options, findings.len());

        info!(
            subsystem = "retrieval",
            component = "cluster",
            finding_count = findings.len(),
            cluster_count = result.clusters.len(),
            unclustered_count = result.unclustered.len(),
            fast_path,
            duration_ms = start.elapsed().as_millis() as u64,
            "Clustering complete"
        );
        result
    }

    async fn refine(&self, presented: &[Finding], query: &str) -> Assignment {
        let bands = similarity_bands(presented);
        let listing: Vec<(String, Vec<(usize, &str)>)> = bands
            .iter()
            .map(|(band, indices)| {
                (
                    band_label(*band, bands.len()),
                    indices
                        .iter()
                        .map(|&i| (i, presented[i].content.as_str()))
                        .collect(),
                )
            })
            .collect();

        let request = GenerationRequest::new(
            cluster_system_prompt(&self.options),
            cluster_user_prompt(query, &listing),
        )
        .with_temperature(defaults::CLUSTER_TEMPERATURE)
        .with_max_tokens(defaults::CLUSTER_MAX_TOKENS)
        .json();

        match self.backend.invoke(request).await {
            Ok(response) => parse_cluster_response(&response.text).unwrap_or_else(|| {
                warn!(
                    subsystem = "retrieval",
                    component = "cluster",
                    response_len = response.text.len(),
                    "Malformed clustering response, using catch-all cluster"
                );
                Assignment::catch_all(presented.len())
            }),
            Err(e) => {
                warn!(
                    subsystem = "retrieval",
                    component = "cluster",
                    error = %e,
                    "Clustering model failed, using catch-all cluster"
                );
                Assignment::catch_all(presented.len())
            }
        }
    }
}

fn parse_cluster_response(text: &str) -> Option<Assignment> {
    let raw: RawResponse = serde_json::from_str(extract_json(text)?).ok()?;
    let method = match raw.method.as_deref().map(str::trim) {
        Some(m) if m.eq_ignore_ascii_case("temporal") => ClusterMethod::Temporal,
        Some(m) if m.eq_ignore_ascii_case("hybrid") => ClusterMethod::Hybrid,
        _ => ClusterMethod::Topic,
    };
    Some(Assignment {
        proposals: raw
            .clusters
            .into_iter()
            .map(|c| Proposal {
                theme: c.theme.trim().to_string(),
                summary: c.summary.trim().to_string(),
                indices: c.finding_ids.iter().filter_map(as_index).collect(),
            })
            .collect(),
        unclustered: raw.unclustered.iter().filter_map(as_index).collect(),
        method,
    })
}

/// `3`, `"3"`, `"[3]"` and `"#3"` all address index 3.
fn as_index(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s
            .trim()
            .trim_matches(|c: char| !c.is_ascii_digit())
            .parse()
            .ok(),
        _ => None,
    }
}

/// Similarity band (tenths) per finding, highest first, unscored last.
/// Without any scores everything shares one bucket.
fn similarity_bands(findings: &[Finding]) -> Vec<(Option<i32>, Vec<usize>)> {
    let mut bands: Vec<(Option<i32>, Vec<usize>)> = Vec::new();
    for (index, finding) in findings.iter().enumerate() {
        let band = finding.similarity.map(|s| (s * 10.0).round() as i32);
        match bands.iter_mut().find(|(b, _)| *b == band) {
            Some((_, members)) => members.push(index),
            None => bands.push((band, vec![index])),
        }
    }
    // None sorts below every Some.
    bands.sort_by(|a, b| b.0.cmp(&a.0));
    bands
}

fn band_label(band: Option<i32>, band_count: usize) -> String {
    match band {
        Some(tenths) => format!("similarity ~{:.1}", tenths as f32 / 10.0),
        None if band_count == 1 => "findings".to_string(),
        None => "unscored".to_string(),
    }
}

/// Findings reordered by similarity band, stable within a band.
fn order_by_band(findings: &[Finding]) -> Vec<Finding> {
    similarity_bands(findings)
        .into_iter()
        .flat_map(|(_, indices)| indices)
        .map(|i| findings[i].clone())
        .collect()
}

/// Post-processing steps 1 through 9.
fn assemble(
    presented: Vec<Finding>,
    overflow: Vec<Finding>,
    assignment: Assignment,
    options: &ClusterOptions,
    total_findings: usize,
) -> ClusteredResult {
    let mut consumed = vec![false; presented.len()];
    let mut clusters: Vec<Cluster> = Vec::new();
    let mut unclustered: Vec<Finding> = Vec::new();

    for proposal in assignment.proposals {
        let mut members = Vec::with_capacity(proposal.indices.len());
        for index in proposal.indices {
            if index < presented.len() && !consumed[index] {
                consumed[index] = true;
                members.push(presented[index].clone());
            }
        }
        if members.is_empty() {
            continue;
        }
        if members.len() < options.min_cluster_size {
            unclustered.extend(members);
            continue;
        }
        members.truncate(options.max_per_cluster);

        let representative_index = select_representative(&members);
        let representative_id = members[representative_index].source_id.clone();
        let theme = if proposal.theme.is_empty() {
            DEFAULT_THEME.to_string()
        } else {
            proposal.theme
        };
        clusters.push(Cluster {
            id: new_v7().to_string(),
            theme,
            summary: proposal.summary,
            confidence: cluster_confidence(&members),
            findings: members,
            representative_id,
            representative_index,
        });
    }

    clusters.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    if clusters.len() > options.max_clusters {
        let dissolved: Vec<Cluster> = clusters.drain(options.max_clusters..).collect();
        for cluster in dissolved.into_iter().rev() {
            unclustered.extend(cluster.findings);
        }
    }

    for index in assignment.unclustered {
        if index < presented.len() && !consumed[index] {
            consumed[index] = true;
            unclustered.push(presented[index].clone());
        }
    }
    unclustered.extend(
        presented
            .into_iter()
            .zip(consumed)
            .filter(|(_, used)| !used)
            .map(|(finding, _)| finding),
    );
    unclustered.extend(overflow);
    unclustered.truncate(defaults::UNCLUSTERED_CEILING);

    ClusteredResult {
        clusters,
        unclustered,
        total_findings,
        method: assignment.method,
    }
}

/// Index of the first pinned member, else the highest similarity (earliest on
/// ties), else the first.
fn select_representative(members: &[Finding]) -> usize {
    if let Some(pinned) = members.iter().position(|f| f.is_pinned()) {
        return pinned;
    }
    let mut best: Option<(usize, f32)> = None;
    for (index, finding) in members.iter().enumerate() {
        if let Some(score) = finding.similarity {
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((index, score));
            }
        }
    }
    best.map_or(0, |(index, _)| index)
}

fn cluster_confidence(members: &[Finding]) -> f32 {
    let scores: Vec<f32> = members.iter().filter_map(|f| f.similarity).collect();
    if scores.is_empty() {
        return UNSCORED_CONFIDENCE;
    }
    let mean = scores.iter().sum::<f32>() / scores.len() as f32;
    (mean * 100.0).round() / 100.0
}
