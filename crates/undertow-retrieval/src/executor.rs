//! Sandboxed plan execution.
//!
//! A plan is interpreted step by step against [`ScopedCapabilities`]; nothing
//! else is reachable from it. Execution races a hard wall-clock timeout.
//! Parse errors, capability failures and timeouts all collapse into
//! [`RetrievalResult::empty`] at the [`PlanExecutor::execute`] boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use undertow_core::{
    defaults, Error, Finding, KnowledgeSurface, Result, RetrievalResult, RetrievalScope,
};

use crate::capabilities::ScopedCapabilities;
use crate::config::RetrievalConfig;
use crate::normalize::normalize_output;
use crate::plan::{Plan, Step};

/// Findings expanded per `expand` step when the plan gives no limit.
const DEFAULT_EXPAND_LIMIT: usize = 10;

/// Runs retrieval plans against a knowledge surface.
#[derive(Clone)]
pub struct PlanExecutor {
    knowledge: Arc<dyn KnowledgeSurface>,
    timeout: Duration,
    max_steps: usize,
}

impl PlanExecutor {
    pub fn new(knowledge: Arc<dyn KnowledgeSurface>) -> Self {
        Self {
            knowledge,
            timeout: Duration::from_secs(defaults::PLAN_TIMEOUT_SECS),
            max_steps: defaults::PLAN_MAX_STEPS,
        }
    }

    pub fn from_config(knowledge: Arc<dyn KnowledgeSurface>, config: &RetrievalConfig) -> Self {
        Self::new(knowledge)
            .with_timeout(config.plan_timeout)
            .with_max_steps(config.plan_max_steps)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Execute a plan; any failure yields an empty result.
    #[instrument(skip(self, plan, scope), fields(subsystem = "retrieval", component = "executor", op = "execute", conversation_id = %scope.conversation_id))]
    pub async fn execute(&self, plan: &str, scope: &RetrievalScope) -> RetrievalResult {
        let start = Instant::now();
        match self.try_execute(plan, scope).await {
            Ok(result) => {
                info!(
                    result_count = result.findings.len(),
                    confidence = result.confidence,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Plan executed"
                );
                result
            }
            Err(e) => {
                warn!(
                    error = %e,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Plan execution failed, using empty result"
                );
                RetrievalResult::empty()
            }
        }
    }

    /// Execute a plan and surface the failure cause.
    pub async fn try_execute(&self, plan: &str, scope: &RetrievalScope) -> Result<RetrievalResult> {
        let plan = Plan::prepare(plan, self.max_steps)?;
        let caps = ScopedCapabilities::new(self.knowledge.clone(), scope.clone());

        let output = tokio::time::timeout(self.timeout, interpret(&plan, &caps))
            .await
            .map_err(|_| {
                Error::Plan(format!(
                    "plan timed out after {}ms",
                    self.timeout.as_millis()
                ))
            })??;

        Ok(normalize_output(output))
    }
}

/// Fixed-dispatch interpreter. Returns the raw value of the `return` step.
async fn interpret(plan: &Plan, caps: &ScopedCapabilities) -> Result<Option<Value>> {
    let mut slots: HashMap<String, Vec<Finding>> = HashMap::new();
    let read = |slots: &HashMap<String, Vec<Finding>>, slot: &str| -> Vec<Finding> {
        slots.get(slot).cloned().unwrap_or_default()
    };

    for (index, step) in plan.steps.iter().enumerate() {
        let output = match step {
            Step::SemanticSearch {
                query,
                limit,
                threshold,
                ..
            } => caps.semantic_search(query, *limit, *threshold).await?,
            Step::KeywordGrep {
                pattern,
                case_sensitive,
                limit,
                ..
            } => caps.keyword_grep(pattern, *case_sensitive, *limit).await?,
            Step::SearchByTime {
                since,
                until,
                query,
                limit,
                ..
            } => {
                caps.search_by_time(since.as_deref(), until.as_deref(), query.as_deref(), *limit)
                    .await?
            }
            Step::GetNodes { ids, .. } => caps.get_nodes(ids).await?,
            Step::Expand { from, limit, .. } => {
                let sources = read(&slots, from);
                let take = limit.unwrap_or(DEFAULT_EXPAND_LIMIT).max(1);
                let mut expanded = Vec::new();
                for source in sources.iter().filter(|f| !f.source_id.is_empty()).take(take) {
                    expanded.extend(caps.get_connected(&source.source_id).await?);
                }
                expanded
            }
            Step::Merge { from, .. } => from.iter().flat_map(|slot| read(&slots, slot)).collect(),
            Step::Dedupe { from, .. } => ScopedCapabilities::dedupe(read(&slots, from)),
            Step::Filter {
                from,
                min_similarity,
                ..
            } => read(&slots, from)
                .into_iter()
                // Unscored findings (exact matches, lookups) pass.
                .filter(|f| f.similarity.map_or(true, |s| s >= *min_similarity))
                .collect(),
            Step::Take { from, limit, .. } => {
                let mut findings = read(&slots, from);
                findings.truncate(*limit);
                findings
            }
            Step::Return {
                from,
                confidence,
                summary,
            } => {
                let findings = read(&slots, from);
                debug!(step = index, result_count = findings.len(), "Plan returned");
                return Ok(Some(json!({
                    "findings": findings,
                    "confidence": confidence.clone().unwrap_or(Value::Null),
                    "summary": summary,
                })));
            }
        };

        debug!(
            step = index,
            op = step.op_name(),
            result_count = output.len(),
            "Plan step complete"
        );
        if let Some(slot) = step.writes() {
            slots.insert(slot.to_string(), output);
        }
    }

    Ok(None)
}
