//! Retrieval plan language.
//!
//! Plans are produced by the strategy model as JSON and interpreted by
//! [`PlanExecutor`](crate::executor::PlanExecutor). Each step is a tagged
//! variant; search steps write to named slots and later steps read them.
//!
//! ```json
//! {"steps": [
//!   {"op": "semantic_search", "query": "pricing", "into": "hits"},
//!   {"op": "take", "from": "hits", "limit": 5, "into": "top"},
//!   {"op": "expand", "from": "top", "into": "related"},
//!   {"op": "merge", "from": ["hits", "related"], "into": "all"},
//!   {"op": "dedupe", "from": "all"},
//!   {"op": "return", "from": "all", "confidence": 0.7}
//! ]}
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::prompts::extract_json;

/// Slot used when a step omits `into` or `from`.
pub const DEFAULT_SLOT: &str = "results";

fn default_slot() -> String {
    DEFAULT_SLOT.to_string()
}

/// Plan validation and parse errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    #[error("plan is not valid JSON: {0}")]
    Parse(String),

    #[error("plan has no steps")]
    Empty,

    #[error("plan has {count} steps, limit is {max}")]
    TooManySteps { count: usize, max: usize },

    #[error("step {step} reads unknown slot '{slot}'")]
    UnknownSlot { step: usize, slot: String },

    #[error("step {step} is a return but is not the last step")]
    MisplacedReturn { step: usize },
}

impl From<PlanError> for undertow_core::Error {
    fn from(e: PlanError) -> Self {
        undertow_core::Error::Plan(e.to_string())
    }
}

/// One instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    SemanticSearch {
        query: String,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        threshold: Option<f32>,
        #[serde(default = "default_slot")]
        into: String,
    },
    KeywordGrep {
        pattern: String,
        #[serde(default)]
        case_sensitive: Option<bool>,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default = "default_slot")]
        into: String,
    },
    SearchByTime {
        #[serde(default)]
        since: Option<String>,
        #[serde(default)]
        until: Option<String>,
        #[serde(default)]
        query: Option<String>,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default = "default_slot")]
        into: String,
    },
    GetNodes {
        ids: Vec<String>,
        #[serde(default = "default_slot")]
        into: String,
    },
    /// Graph neighbours of the first `limit` findings in `from`.
    Expand {
        #[serde(default = "default_slot")]
        from: String,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default = "default_slot")]
        into: String,
    },
    Merge {
        from: Vec<String>,
        #[serde(default = "default_slot")]
        into: String,
    },
    Dedupe {
        #[serde(default = "default_slot")]
        from: String,
        #[serde(default)]
        into: Option<String>,
    },
    Filter {
        #[serde(default = "default_slot")]
        from: String,
        min_similarity: f32,
        #[serde(default)]
        into: Option<String>,
    },
    Take {
        #[serde(default = "default_slot")]
        from: String,
        limit: usize,
        #[serde(default)]
        into: Option<String>,
    },
    Return {
        #[serde(default = "default_slot")]
        from: String,
        /// Left untyped so a malformed value degrades to the default confidence.
        #[serde(default)]
        confidence: Option<serde_json::Value>,
        #[serde(default)]
        summary: Option<String>,
    },
}

impl Step {
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::SemanticSearch { .. } => "semantic_search",
            Self::KeywordGrep { .. } => "keyword_grep",
            Self::SearchByTime { .. } => "search_by_time",
            Self::GetNodes { .. } => "get_nodes",
            Self::Expand { .. } => "expand",
            Self::Merge { .. } => "merge",
            Self::Dedupe { .. } => "dedupe",
            Self::Filter { .. } => "filter",
            Self::Take { .. } => "take",
            Self::Return { .. } => "return",
        }
    }

    /// Slots this step reads.
    pub fn reads(&self) -> Vec<&str> {
        match self {
            Self::SemanticSearch { .. }
            | Self::KeywordGrep { .. }
            | Self::SearchByTime { .. }
            | Self::GetNodes { .. } => Vec::new(),
            Self::Merge { from, .. } => from.iter().map(String::as_str).collect(),
            Self::Expand { from, .. }
            | Self::Dedupe { from, .. }
            | Self::Filter { from, .. }
            | Self::Take { from, .. }
            | Self::Return { from, .. } => vec![from.as_str()],
        }
    }

    /// Slot this step writes. Transforms without `into` rewrite their source.
    pub fn writes(&self) -> Option<&str> {
        match self {
            Self::SemanticSearch { into, .. }
            | Self::KeywordGrep { into, .. }
            | Self::SearchByTime { into, .. }
            | Self::GetNodes { into, .. }
            | Self::Expand { into, .. }
            | Self::Merge { into, .. } => Some(into),
            Self::Dedupe { from, into }
            | Self::Filter { from, into, .. }
            | Self::Take { from, into, .. } => Some(into.as_deref().unwrap_or(from)),
            Self::Return { .. } => None,
        }
    }

    pub fn is_return(&self) -> bool {
        matches!(self, Self::Return { .. })
    }
}

#[derive(Deserialize)]
struct PlanDocument {
    steps: Vec<Step>,
}

/// A parsed, validated retrieval plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub steps: Vec<Step>,
}

impl Plan {
    /// Parse model output: `{"steps": [...]}` or a bare step array, optionally
    /// wrapped in prose or a code fence.
    pub fn parse(text: &str) -> Result<Self, PlanError> {
        let json = extract_json(text).ok_or_else(|| PlanError::Parse("no JSON found".into()))?;
        let steps = if json.starts_with('[') {
            serde_json::from_str::<Vec<Step>>(json)
        } else {
            serde_json::from_str::<PlanDocument>(json).map(|doc| doc.steps)
        }
        .map_err(|e| PlanError::Parse(e.to_string()))?;
        Ok(Self { steps })
    }

    /// Parse, repair and validate in one go.
    pub fn prepare(text: &str, max_steps: usize) -> Result<Self, PlanError> {
        let mut plan = Self::parse(text)?;
        if plan.steps.is_empty() {
            return Err(PlanError::Empty);
        }
        // Repair may add a return; count only what the model wrote.
        if plan.steps.len() > max_steps {
            return Err(PlanError::TooManySteps {
                count: plan.steps.len(),
                max: max_steps,
            });
        }
        plan.repair();
        plan.validate()?;
        Ok(plan)
    }

    /// Append `return <last written slot>` when the plan never returns.
    ///
    /// Returns whether the plan was changed.
    pub fn repair(&mut self) -> bool {
        if self.steps.iter().any(Step::is_return) {
            return false;
        }
        let Some(last) = self.steps.iter().rev().find_map(Step::writes) else {
            return false;
        };
        let from = last.to_string();
        self.steps.push(Step::Return {
            from,
            confidence: None,
            summary: None,
        });
        true
    }

    /// Every read refers to an earlier write, and exactly one return ends the plan.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut written: HashSet<&str> = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if step.is_return() && index + 1 != self.steps.len() {
                return Err(PlanError::MisplacedReturn { step: index });
            }
            if let Some(slot) = step.reads().into_iter().find(|s| !written.contains(s)) {
                return Err(PlanError::UnknownSlot {
                    step: index,
                    slot: slot.to_string(),
                });
            }
            if let Some(slot) = step.writes() {
                written.insert(slot);
            }
        }

        match self.steps.last() {
            Some(step) if step.is_return() => Ok(()),
            _ => Err(PlanError::MisplacedReturn {
                step: self.steps.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_document_and_defaults() {
        let plan = Plan::parse(
            r#"{"steps":[{"op":"semantic_search","query":"pricing"},{"op":"return","confidence":0.8}]}"#,
        )
        .unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].writes(), Some(DEFAULT_SLOT));
        assert_eq!(plan.steps[1].reads(), vec![DEFAULT_SLOT]);
        plan.validate().unwrap();
    }

    #[test]
    fn test_parse_bare_array_in_fence() {
        let plan = Plan::parse(
            "```json\n[{\"op\":\"keyword_grep\",\"pattern\":\"ACME\",\"into\":\"m\"},{\"op\":\"return\",\"from\":\"m\"}]\n```",
        )
        .unwrap();
        assert!(matches!(plan.steps[0], Step::KeywordGrep { .. }));
    }

    #[test]
    fn test_parse_after_bracketed_prose() {
        let plan = Plan::parse(
            "Plan [v1] below:\n{\"steps\": [{\"op\":\"semantic_search\",\"query\":\"pricing\",\"into\":\"a\"},{\"op\":\"return\",\"from\":\"a\"}]}",
        )
        .unwrap();
        assert_eq!(plan.steps.len(), 2);
        plan.validate().unwrap();
    }

    #[test]
    fn test_parse_rejects_unknown_op() {
        let err = Plan::parse(r#"{"steps":[{"op":"rm_rf","path":"/"}]}"#).unwrap_err();
        assert!(matches!(err, PlanError::Parse(_)));
        assert!(matches!(Plan::parse("nothing"), Err(PlanError::Parse(_))));
    }

    #[test]
    fn test_repair_appends_return_of_last_slot() {
        let mut plan = Plan::parse(
            r#"[{"op":"semantic_search","query":"a","into":"x"},{"op":"take","from":"x","limit":3,"into":"top"}]"#,
        )
        .unwrap();
        assert!(plan.repair());
        assert_eq!(
            plan.steps.last(),
            Some(&Step::Return {
                from: "top".into(),
                confidence: None,
                summary: None
            })
        );
        assert!(!plan.repair());
        plan.validate().unwrap();
    }

    #[test]
    fn test_validate_unknown_slot() {
        let err = Plan::prepare(
            r#"[{"op":"semantic_search","query":"a","into":"x"},{"op":"merge","from":["x","y"],"into":"z"},{"op":"return","from":"z"}]"#,
            16,
        )
        .unwrap_err();
        assert_eq!(
            err,
            PlanError::UnknownSlot {
                step: 1,
                slot: "y".into()
            }
        );
    }

    #[test]
    fn test_validate_misplaced_return() {
        let err = Plan::prepare(
            r#"[{"op":"semantic_search","query":"a"},{"op":"return"},{"op":"dedupe"}]"#,
            16,
        )
        .unwrap_err();
        assert_eq!(err, PlanError::MisplacedReturn { step: 1 });
    }

    #[test]
    fn test_prepare_limits_steps() {
        let steps: Vec<String> = (0..5)
            .map(|i| format!(r#"{{"op":"semantic_search","query":"q{}"}}"#, i))
            .collect();
        let text = format!("[{}]", steps.join(","));
        assert_eq!(
            Plan::prepare(&text, 4).unwrap_err(),
            PlanError::TooManySteps { count: 5, max: 4 }
        );
        // At the limit, repair may still add the return.
        assert_eq!(Plan::prepare(&text, 5).unwrap().steps.len(), 6);
        assert_eq!(Plan::prepare("[]", 5).unwrap_err(), PlanError::Empty);
    }

    #[test]
    fn test_transform_without_into_rewrites_source() {
        let step = Step::Dedupe {
            from: "hits".into(),
            into: None,
        };
        assert_eq!(step.writes(), Some("hits"));
    }
}
