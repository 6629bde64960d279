//! Two-stage decision pipeline: a cheap gate, then plan generation.
//!
//! Every model failure fails closed. Retrieval is always optional, so a
//! broken gate or strategist yields [`Decision::Skip`], never an error.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use undertow_core::{defaults, ConversationContext, GenerationBackend, GenerationRequest};

use crate::depth::{classify, RetrievalDepth};
use crate::prompts::{
    gate_user_prompt, strategy_user_prompt, strip_code_fences, GATE_SYSTEM_PROMPT,
    STRATEGY_SYSTEM_PROMPT,
};

/// Reason recorded when the gate is bypassed.
pub const COMPREHENSIVE_REASON: &str = "Comprehensive query detected.";

/// Outcome of the gate call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub should_retrieve: bool,
    pub reason: String,
}

impl GateDecision {
    fn declined(reason: impl Into<String>) -> Self {
        Self {
            should_retrieve: false,
            reason: reason.into(),
        }
    }
}

/// Final decision for one query.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Skip {
        depth: RetrievalDepth,
        reason: String,
    },
    Retrieve {
        depth: RetrievalDepth,
        /// Plan JSON with code fences stripped.
        plan: String,
        reason: String,
    },
}

impl Decision {
    pub fn depth(&self) -> RetrievalDepth {
        match self {
            Self::Skip { depth, .. } | Self::Retrieve { depth, .. } => *depth,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Skip { reason, .. } | Self::Retrieve { reason, .. } => reason,
        }
    }

    pub fn plan(&self) -> Option<&str> {
        match self {
            Self::Retrieve { plan, .. } => Some(plan),
            Self::Skip { .. } => None,
        }
    }
}

/// Parse a gate reply: an affirmative leading token means retrieve.
pub fn parse_gate_response(text: &str) -> GateDecision {
    let cleaned = text
        .trim()
        .trim_start_matches(|c: char| matches!(c, '*' | '_' | '#' | '`' | '"' | '\'' | '>'))
        .trim_start();

    let first_token: String = cleaned
        .chars()
        .take_while(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    let should_retrieve = matches!(first_token.as_str(), "yes" | "y" | "true" | "retrieve");

    let rest = cleaned[first_token.len()..]
        .trim_start_matches(|c: char| !c.is_alphanumeric())
        .trim();
    let reason = first_sentence(rest);

    GateDecision {
        should_retrieve,
        reason: if reason.is_empty() {
            if should_retrieve {
                "Gate approved deep retrieval.".to_string()
            } else {
                "Gate declined deep retrieval.".to_string()
            }
        } else {
            reason
        },
    }
}

fn first_sentence(text: &str) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    match line.find(['.', '!', '?']) {
        Some(pos) => line[..=pos].to_string(),
        None => line.to_string(),
    }
}

/// Gate + strategy over two generation tiers.
pub struct DecisionPipeline {
    gate: Arc<dyn GenerationBackend>,
    strategist: Arc<dyn GenerationBackend>,
    recent_turns_window: usize,
}

impl DecisionPipeline {
    /// `gate` should be the low-latency tier, `strategist` the capable one.
    pub fn new(gate: Arc<dyn GenerationBackend>, strategist: Arc<dyn GenerationBackend>) -> Self {
        Self {
            gate,
            strategist,
            recent_turns_window: defaults::RECENT_TURNS_WINDOW,
        }
    }

    pub fn with_recent_turns_window(mut self, window: usize) -> Self {
        self.recent_turns_window = window;
        self
    }

    /// Ask the low-latency model whether deep retrieval is worth it.
    pub async fn gate(&self, query: &str, context: &ConversationContext) -> GateDecision {
        let start = Instant::now();
        let request = GenerationRequest::new(
            GATE_SYSTEM_PROMPT,
            gate_user_prompt(
                query,
                &context.prefetch,
                context.windowed(self.recent_turns_window),
            ),
        )
        .with_temperature(defaults::GATE_TEMPERATURE)
        .with_max_tokens(defaults::GATE_MAX_TOKENS);

        match self.gate.invoke(request).await {
            Ok(response) => {
                let decision = parse_gate_response(&response.text);
                debug!(
                    subsystem = "retrieval",
                    component = "decision",
                    op = "gate",
                    model = %self.gate.model_name(),
                    should_retrieve = decision.should_retrieve,
                    reason = %decision.reason,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Gate decided"
                );
                decision
            }
            Err(e) => {
                warn!(
                    subsystem = "retrieval",
                    component = "decision",
                    op = "gate",
                    error = %e,
                    "Gate call failed, skipping retrieval"
                );
                GateDecision::declined(format!("Gate unavailable: {}", e))
            }
        }
    }

    /// Ask the capable model for a retrieval plan. `None` on failure or empty output.
    pub async fn strategize(
        &self,
        query: &str,
        reason: &str,
        context: &ConversationContext,
    ) -> Option<String> {
        let start = Instant::now();
        let request = GenerationRequest::new(
            STRATEGY_SYSTEM_PROMPT,
            strategy_user_prompt(query, reason, context.windowed(self.recent_turns_window)),
        )
        .with_temperature(defaults::STRATEGY_TEMPERATURE)
        .with_max_tokens(defaults::STRATEGY_MAX_TOKENS)
        .json();

        match self.strategist.invoke(request).await {
            Ok(response) => {
                let plan = strip_code_fences(&response.text).to_string();
                debug!(
                    subsystem = "retrieval",
                    component = "decision",
                    op = "strategize",
                    model = %self.strategist.model_name(),
                    plan_len = plan.len(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Strategy generated"
                );
                (!plan.is_empty()).then_some(plan)
            }
            Err(e) => {
                warn!(
                    subsystem = "retrieval",
                    component = "decision",
                    op = "strategize",
                    error = %e,
                    "Strategy call failed, skipping retrieval"
                );
                None
            }
        }
    }

    /// Classify, gate when needed, then plan.
    pub async fn decide(&self, query: &str, context: &ConversationContext) -> Decision {
        self.decide_at_depth(query, classify(query), context).await
    }

    /// [`decide`](Self::decide) for a query the caller has already classified.
    pub async fn decide_at_depth(
        &self,
        query: &str,
        depth: RetrievalDepth,
        context: &ConversationContext,
    ) -> Decision {
        let reason = match depth {
            RetrievalDepth::Quick => {
                debug!(
                    subsystem = "retrieval",
                    component = "decision",
                    depth = %depth,
                    "Quick query, skipping pipeline"
                );
                return Decision::Skip {
                    depth,
                    reason: "Quick query.".to_string(),
                };
            }
            RetrievalDepth::Comprehensive => COMPREHENSIVE_REASON.to_string(),
            RetrievalDepth::Standard => {
                let gate = self.gate(query, context).await;
                if !gate.should_retrieve {
                    return Decision::Skip {
                        depth,
                        reason: gate.reason,
                    };
                }
                gate.reason
            }
        };

        match self.strategize(query, &reason, context).await {
            Some(plan) => {
                info!(
                    subsystem = "retrieval",
                    component = "decision",
                    depth = %depth,
                    reason = %reason,
                    "Deep retrieval approved"
                );
                Decision::Retrieve {
                    depth,
                    plan,
                    reason,
                }
            }
            None => Decision::Skip {
                depth,
                reason: "No retrieval plan produced.".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use undertow_inference::mock::MockGenerationBackend;

    const PLAN: &str = r#"{"steps":[{"op":"semantic_search","query":"pricing","into":"a"},{"op":"return","from":"a"}]}"#;

    fn pipeline(
        gate: &MockGenerationBackend,
        strategist: &MockGenerationBackend,
    ) -> DecisionPipeline {
        DecisionPipeline::new(Arc::new(gate.clone()), Arc::new(strategist.clone()))
    }

    #[test]
    fn test_parse_gate_affirmative() {
        let d = parse_gate_response("YES - the user wants older pricing threads. Extra.");
        assert!(d.should_retrieve);
        assert_eq!(d.reason, "the user wants older pricing threads.");

        assert!(parse_gate_response("**Yes**, multiple topics.").should_retrieve);
        assert!(parse_gate_response("retrieve: weak prefetch").should_retrieve);
    }

    #[test]
    fn test_parse_gate_negative_and_garbage() {
        assert!(!parse_gate_response("NO. Prefetch is strong.").should_retrieve);
        assert!(!parse_gate_response("Yesterday's data is enough").should_retrieve);
        let d = parse_gate_response("");
        assert!(!d.should_retrieve);
        assert!(!d.reason.is_empty());
    }

    #[tokio::test]
    async fn test_quick_query_makes_no_model_calls() {
        let gate = MockGenerationBackend::new().with_fixed_response("YES");
        let strategist = MockGenerationBackend::new().with_fixed_response(PLAN);

        let decision = pipeline(&gate, &strategist)
            .decide("what is the capital of France", &ConversationContext::default())
            .await;

        assert!(matches!(decision, Decision::Skip { depth: RetrievalDepth::Quick, .. }));
        assert_eq!(gate.call_count(), 0);
        assert_eq!(strategist.call_count(), 0);
    }

    #[tokio::test]
    async fn test_comprehensive_bypasses_gate() {
        let gate = MockGenerationBackend::new().with_fixed_response("NO");
        let strategist = MockGenerationBackend::new().with_fixed_response(PLAN);

        let decision = pipeline(&gate, &strategist)
            .decide(
                "give me the full timeline of all pricing decisions and trade-offs we discussed",
                &ConversationContext::default(),
            )
            .await;

        assert_eq!(decision.depth(), RetrievalDepth::Comprehensive);
        assert_eq!(decision.reason(), COMPREHENSIVE_REASON);
        assert_eq!(decision.plan(), Some(PLAN));
        assert_eq!(gate.call_count(), 0);
        assert_eq!(strategist.call_count(), 1);
        assert!(strategist.get_calls()[0].user_prompt.contains(COMPREHENSIVE_REASON));
    }

    #[tokio::test]
    async fn test_standard_gate_declines() {
        let gate = MockGenerationBackend::new().with_fixed_response("NO. Prefetch already covers it.");
        let strategist = MockGenerationBackend::new().with_fixed_response(PLAN);

        let decision = pipeline(&gate, &strategist)
            .decide(
                "remind me what we said about the vendor contract renewal",
                &ConversationContext::default(),
            )
            .await;

        assert_eq!(
            decision,
            Decision::Skip {
                depth: RetrievalDepth::Standard,
                reason: "Prefetch already covers it.".to_string()
            }
        );
        assert_eq!(gate.call_count(), 1);
        assert_eq!(strategist.call_count(), 0);
    }

    #[tokio::test]
    async fn test_standard_gate_approves_and_plans() {
        let gate = MockGenerationBackend::new().with_fixed_response("YES. Weak prefetch.");
        let strategist =
            MockGenerationBackend::new().with_fixed_response(format!("```json\n{}\n```", PLAN));

        let context = ConversationContext {
            recent_turns: (0..10).map(|i| format!("turn {}", i)).collect(),
            ..Default::default()
        };
        let decision = pipeline(&gate, &strategist)
            .decide("remind me what we said about the vendor contract renewal", &context)
            .await;

        assert_eq!(decision.plan(), Some(PLAN));
        assert_eq!(decision.reason(), "Weak prefetch.");

        let gate_call = &gate.get_calls()[0];
        assert!(gate_call.user_prompt.contains("turn 9"));
        assert!(!gate_call.user_prompt.contains("turn 5"));
        assert_eq!(gate_call.temperature, Some(defaults::GATE_TEMPERATURE));
        assert!(strategist.get_calls()[0].json);
    }

    #[tokio::test]
    async fn test_gate_failure_fails_closed() {
        let gate = MockGenerationBackend::new().failing("connection refused");
        let strategist = MockGenerationBackend::new().with_fixed_response(PLAN);

        let decision = pipeline(&gate, &strategist)
            .decide(
                "remind me what we said about the vendor contract renewal",
                &ConversationContext::default(),
            )
            .await;

        assert!(decision.plan().is_none());
        assert_eq!(strategist.call_count(), 0);
    }

    #[tokio::test]
    async fn test_strategy_failure_fails_closed() {
        let gate = MockGenerationBackend::new();
        let strategist = MockGenerationBackend::new().failing("model not loaded");

        let decision = pipeline(&gate, &strategist)
            .decide("everything about onboarding", &ConversationContext::default())
            .await;

        assert!(matches!(
            decision,
            Decision::Skip { depth: RetrievalDepth::Comprehensive, .. }
        ));
    }

    #[tokio::test]
    async fn test_decide_at_depth_uses_given_depth() {
        let gate = MockGenerationBackend::new().with_fixed_response("NO. Not needed.");
        let strategist = MockGenerationBackend::new().with_fixed_response(PLAN);

        // Would classify as standard; the supplied depth skips the gate.
        let decision = pipeline(&gate, &strategist)
            .decide_at_depth(
                "remind me what we said about the vendor contract renewal",
                RetrievalDepth::Comprehensive,
                &ConversationContext::default(),
            )
            .await;

        assert_eq!(decision.depth(), RetrievalDepth::Comprehensive);
        assert_eq!(decision.plan(), Some(PLAN));
        assert_eq!(decision.reason(), COMPREHENSIVE_REASON);
        assert_eq!(gate.call_count(), 0);
    }
}
