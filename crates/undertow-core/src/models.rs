//! Data models for the deep retrieval pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::defaults;

// =============================================================================
// TASK TYPES
// =============================================================================

/// Status of a deep retrieval task.
///
/// The lifecycle is strictly `Pending -> Running -> (Complete | Failed)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Complete,
    Failed,
}

impl TaskStatus {
    /// Database/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Complete)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// Scheduling priority of a task. Higher priorities are claimed first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl TaskPriority {
    /// Numeric rank stored in the queue (`ORDER BY priority DESC`).
    pub fn rank(&self) -> i16 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
        }
    }

    /// Inverse of [`rank`](Self::rank). Out-of-range values clamp to the nearest tier.
    pub fn from_rank(rank: i16) -> Self {
        match rank {
            i16::MIN..=0 => Self::Low,
            1 => Self::Normal,
            _ => Self::High,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(format!("unknown task priority: {}", other)),
        }
    }
}

/// Pipeline stage reported in task progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStage {
    Searching,
    Analyzing,
    Clustering,
    Synthesizing,
}

impl ProgressStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Searching => "searching",
            Self::Analyzing => "analyzing",
            Self::Clustering => "clustering",
            Self::Synthesizing => "synthesizing",
        }
    }
}

/// Advisory progress record attached to a running task. Each update overwrites the last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub stage: ProgressStage,
    /// Findings retrieved so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub found: Option<u32>,
    /// Clusters or items processed so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TaskProgress {
    pub fn new(stage: ProgressStage) -> Self {
        Self {
            stage,
            found: None,
            processed: None,
            percent: None,
            message: None,
        }
    }

    pub fn with_found(mut self, found: usize) -> Self {
        self.found = Some(found.min(u32::MAX as usize) as u32);
        self
    }

    pub fn with_processed(mut self, processed: usize) -> Self {
        self.processed = Some(processed.min(u32::MAX as usize) as u32);
        self
    }

    /// Percent complete, clamped to 100.
    pub fn with_percent(mut self, percent: u8) -> Self {
        self.percent = Some(percent.min(100));
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Summary of prior low-cost retrieval, captured by the foreground handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrefetchSnapshot {
    /// Best similarity score among pre-fetched results, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_score: Option<f32>,
    #[serde(default)]
    pub result_count: usize,
}

/// Conversation context carried with a task so the worker can decide and synthesize.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    /// Most recent turns, oldest first.
    #[serde(default)]
    pub recent_turns: Vec<String>,
    #[serde(default)]
    pub prefetch: PrefetchSnapshot,
}

impl ConversationContext {
    /// Keep only the last `window` turns.
    pub fn windowed(&self, window: usize) -> &[String] {
        let start = self.recent_turns.len().saturating_sub(window);
        &self.recent_turns[start..]
    }
}

/// Request to create a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub objective: String,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    pub user_id: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
    pub conversation_id: String,
    #[serde(default)]
    pub context: ConversationContext,
}

impl NewTask {
    pub fn new(
        objective: impl Into<String>,
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            objective: objective.into(),
            plan: None,
            priority: TaskPriority::Normal,
            user_id: user_id.into(),
            workspace_id: None,
            conversation_id: conversation_id.into(),
            context: ConversationContext::default(),
        }
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = Some(plan.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn with_context(mut self, context: ConversationContext) -> Self {
        self.context = context;
        self
    }
}

/// A unit of background deep retrieval work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub objective: String,
    /// Retrieval plan source. `None` when the strategy step runs inline in the worker.
    pub plan: Option<String>,
    pub priority: TaskPriority,
    pub user_id: String,
    pub workspace_id: Option<String>,
    pub conversation_id: String,
    pub status: TaskStatus,
    pub progress: Option<TaskProgress>,
    /// Set if and only if `status == Complete`.
    pub result: Option<ResurfaceRecord>,
    /// Set if and only if `status == Failed`.
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub context: ConversationContext,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a pending task from a creation request.
    pub fn from_new(id: Uuid, new: NewTask, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            objective: new.objective,
            plan: new.plan.filter(|p| !p.trim().is_empty()),
            priority: new.priority,
            user_id: new.user_id,
            workspace_id: new.workspace_id,
            conversation_id: new.conversation_id,
            status: TaskStatus::Pending,
            progress: None,
            result: None,
            error: None,
            duration_ms: None,
            context: new.context,
            created_at,
            started_at: None,
            completed_at: None,
        }
    }

    /// Scope used when binding knowledge capabilities for this task.
    pub fn scope(&self) -> RetrievalScope {
        RetrievalScope {
            user_id: self.user_id.clone(),
            workspace_id: self.workspace_id.clone(),
            conversation_id: self.conversation_id.clone(),
        }
    }
}

/// Queue statistics summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub complete: i64,
    pub failed: i64,
    pub total: i64,
}

// =============================================================================
// RETRIEVAL TYPES
// =============================================================================

/// Owner scope for knowledge capability calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetrievalScope {
    pub user_id: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
    pub conversation_id: String,
}

impl RetrievalScope {
    pub fn new(user_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            workspace_id: None,
            conversation_id: conversation_id.into(),
        }
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }
}

/// One atomic piece of retrieved knowledge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub source_id: String,
    #[serde(default)]
    pub content: String,
    /// Similarity to the query in `[0, 1]`, when the producing search scores results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_ids: Option<Vec<String>>,
}

impl Finding {
    pub fn new(source_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_similarity(mut self, similarity: f32) -> Self {
        self.similarity = Some(similarity);
        self
    }

    pub fn with_pinned(mut self, pinned: bool) -> Self {
        self.pinned = Some(pinned);
        self
    }

    pub fn with_connected(mut self, ids: Vec<String>) -> Self {
        self.connected_ids = Some(ids);
        self
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.unwrap_or(false)
    }
}

/// Canonical output of executing a retrieval plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub findings: Vec<Finding>,
    /// Plan's self-reported confidence in `[0, 1]`.
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl RetrievalResult {
    /// The result of a failed or timed-out execution.
    pub fn empty() -> Self {
        Self {
            findings: Vec::new(),
            confidence: 0.0,
            summary: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }
}

/// How clusters were formed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMethod {
    #[default]
    Topic,
    Temporal,
    Hybrid,
}

/// A themed group of findings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub theme: String,
    pub summary: String,
    /// Mean member similarity, rounded to two decimals.
    pub confidence: f32,
    pub findings: Vec<Finding>,
    pub representative_id: String,
    /// Position of the representative in `findings`.
    #[serde(default)]
    pub representative_index: usize,
}

impl Cluster {
    /// The representative finding. Resolved by position, so empty or
    /// repeated source ids stay unambiguous.
    pub fn representative(&self) -> Option<&Finding> {
        self.findings.get(self.representative_index)
    }
}

/// Output of the clustering engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteredResult {
    /// Sorted by descending confidence.
    pub clusters: Vec<Cluster>,
    pub unclustered: Vec<Finding>,
    pub total_findings: usize,
    pub method: ClusterMethod,
}

impl ClusteredResult {
    pub fn empty() -> Self {
        Self {
            clusters: Vec::new(),
            unclustered: Vec::new(),
            total_findings: 0,
            method: ClusterMethod::default(),
        }
    }
}

/// Record written on task completion and read by the resurfacing layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResurfaceRecord {
    /// Conversational follow-up. Empty means "nothing to report".
    pub summary: String,
    pub clusters: Vec<Cluster>,
    pub unclustered: Vec<Finding>,
    pub confidence: f32,
    pub total_findings: usize,
}

impl ResurfaceRecord {
    /// A completed retrieval that found nothing worth reporting.
    pub fn empty() -> Self {
        Self {
            summary: String::new(),
            clusters: Vec::new(),
            unclustered: Vec::new(),
            confidence: 0.0,
            total_findings: 0,
        }
    }

    pub fn from_clustered(summary: String, clustered: ClusteredResult, confidence: f32) -> Self {
        Self {
            summary,
            total_findings: clustered.total_findings,
            clusters: clustered.clusters,
            unclustered: clustered.unclustered,
            confidence,
        }
    }

    /// Whether the resurfacing layer should deliver this record.
    pub fn is_reportable(&self) -> bool {
        !self.summary.trim().is_empty() && self.total_findings > 0
    }
}

// =============================================================================
// KNOWLEDGE CAPABILITY PARAMETERS
// =============================================================================

/// Parameters for `semantic_search`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SemanticSearchOptions {
    pub limit: usize,
    pub threshold: f32,
}

impl Default for SemanticSearchOptions {
    fn default() -> Self {
        Self {
            limit: defaults::SEMANTIC_SEARCH_LIMIT,
            threshold: defaults::SEMANTIC_SEARCH_THRESHOLD,
        }
    }
}

/// Parameters for `keyword_grep`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrepOptions {
    pub case_sensitive: bool,
    pub limit: usize,
}

impl Default for GrepOptions {
    fn default() -> Self {
        Self {
            case_sensitive: false,
            limit: defaults::GREP_LIMIT,
        }
    }
}

/// Resolved parameters for `search_by_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub since: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub limit: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Complete));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));

        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Complete));
        assert!(!TaskStatus::Complete.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Complete.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn test_status_terminal() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Complete.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_round_trip_str() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Complete,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("cancelled".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_priority_rank_ordering() {
        assert!(TaskPriority::High.rank() > TaskPriority::Normal.rank());
        assert!(TaskPriority::Normal.rank() > TaskPriority::Low.rank());
        assert_eq!(TaskPriority::from_rank(7), TaskPriority::High);
        assert_eq!(TaskPriority::from_rank(-3), TaskPriority::Low);
        assert_eq!("HIGH".parse::<TaskPriority>().unwrap(), TaskPriority::High);
    }

    #[test]
    fn test_progress_percent_clamped() {
        let progress = TaskProgress::new(ProgressStage::Clustering)
            .with_found(12)
            .with_percent(250);
        assert_eq!(progress.percent, Some(100));
        assert_eq!(progress.found, Some(12));
    }

    #[test]
    fn test_progress_serializes_sparse() {
        let progress = TaskProgress::new(ProgressStage::Searching);
        let json = serde_json::to_value(&progress).unwrap();
        assert_eq!(json, serde_json::json!({"stage": "searching"}));
    }

    #[test]
    fn test_context_window() {
        let ctx = ConversationContext {
            recent_turns: vec!["a".into(), "b".into(), "c".into()],
            prefetch: PrefetchSnapshot::default(),
        };
        assert_eq!(ctx.windowed(2), &["b".to_string(), "c".to_string()]);
        assert_eq!(ctx.windowed(10).len(), 3);
    }

    #[test]
    fn test_task_from_new_drops_blank_plan() {
        let new = NewTask::new("pricing history", "u1", "c1").with_plan("   ");
        let task = Task::from_new(Uuid::nil(), new, Utc::now());
        assert!(task.plan.is_none());
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.result.is_none());
        assert!(task.error.is_none());
    }

    #[test]
    fn test_finding_serde_defaults() {
        let finding: Finding = serde_json::from_str(r#"{"source_id": "n1"}"#).unwrap();
        assert_eq!(finding.source_id, "n1");
        assert!(finding.content.is_empty());
        assert!(!finding.is_pinned());
    }

    #[test]
    fn test_resurface_record_reportable() {
        assert!(!ResurfaceRecord::empty().is_reportable());

        let mut record = ResurfaceRecord::empty();
        record.summary = "I dug up two more threads on pricing.".into();
        record.total_findings = 2;
        assert!(record.is_reportable());
    }

    #[test]
    fn test_cluster_representative_lookup() {
        let cluster = Cluster {
            id: "c1".into(),
            theme: "Pricing".into(),
            summary: String::new(),
            confidence: 0.8,
            findings: vec![Finding::new("a", "x"), Finding::new("b", "y")],
            representative_id: "b".into(),
            representative_index: 1,
        };
        assert_eq!(cluster.representative().map(|f| f.content.as_str()), Some("y"));
    }

    #[test]
    fn test_cluster_representative_with_blank_ids() {
        let cluster = Cluster {
            id: "c1".into(),
            theme: "Pricing".into(),
            summary: String::new(),
            confidence: 0.5,
            findings: vec![
                Finding::new("", "first"),
                Finding::new("", "second"),
                Finding::new("", "third"),
            ],
            representative_id: String::new(),
            representative_index: 2,
        };
        assert_eq!(
            cluster.representative().map(|f| f.content.as_str()),
            Some("third")
        );

        let out_of_range = Cluster {
            representative_index: 9,
            ..cluster
        };
        assert!(out_of_range.representative().is_none());
    }
}
