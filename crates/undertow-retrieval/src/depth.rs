//! Query depth classification.
//!
//! A pure, allocation-light heuristic that decides how much of the deep
//! retrieval pipeline a query deserves:
//!
//! 1. Breadth, temporal and reasoning-archaeology signals → `Comprehensive`
//! 2. Factual-question starters, resource requests, greetings → `Quick`
//! 3. Structural fallback on word count
//!
//! Comprehensive checks run first so an explicit breadth signal overrides a
//! short-looking query.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use undertow_core::defaults;

/// How deep a query should be retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalDepth {
    /// Skip the pipeline entirely.
    Quick,
    /// Run the gate decision.
    Standard,
    /// Bypass the gate and always plan.
    Comprehensive,
}

impl RetrievalDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Standard => "standard",
            Self::Comprehensive => "comprehensive",
        }
    }
}

impl fmt::Display for RetrievalDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit breadth, temporal and "why did we" phrases.
const COMPREHENSIVE_PHRASES: &[&str] = &[
    // Explicit breadth
    "everything",
    "comprehensive",
    "in depth",
    "in-depth",
    "deep dive",
    "all the details",
    "exhaustive",
    "thorough",
    "find more",
    "dig up",
    "full picture",
    // Temporal
    "timeline",
    "full history",
    "history of",
    "over time",
    "evolution of",
    "chronolog",
    "since the beginning",
    "from the start",
    // Reasoning archaeology
    "why did we",
    "why we decided",
    "what led to",
    "reasoning behind",
    "rationale",
    "trade-offs",
    "tradeoffs",
    "trade offs",
    "decision history",
    "how we got to",
    "what did we decide",
];

static COMPREHENSIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // "all (of) (the|our|my) ... decisions"
        r"\b(?:all|every)\s+(?:of\s+)?(?:the\s+|our\s+|my\s+|those\s+)?(?:\w+\s+)?(?:decisions|discussions|conversations|notes|mentions|times|meetings|references)\b",
        // "over the last 3 months", "across the past few weeks"
        r"\b(?:over|across|during|in|from)\s+the\s+(?:past|last)\s+(?:\d+|few|several|couple(?:\s+of)?)\s+(?:days|weeks|months|years|quarters|sprints)\b",
        // "how has the design evolved"
        r"\bhow\s+(?:has|have|did|does)\b.*\b(?:evolve|evolved|change|changed|develop|developed|shift|shifted|progress|progressed)\b",
    ]
    .into_iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Factual-question starters answered from prefetched context.
const QUICK_STARTERS: &[&str] = &[
    "what is",
    "what's",
    "who is",
    "where is",
    "when is",
    "define",
    "definition of",
    "how do i",
    "how to",
    "what does",
    "convert",
    "translate",
];

/// Requests for a single resource.
const QUICK_RESOURCE_PHRASES: &[&str] = &[
    "link to",
    "show me the",
    "open the",
    "url for",
    "where can i find",
];

static QUICK_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Greetings and acknowledgements
        r"^(?:hi|hello|hey|thanks|thank you|thx|ok|okay|cool|great|nice|got it|sure|yes|no|yep|nope)[\s!.,?]*$",
        // Short wh-question about a single thing
        r"^(?:what|who|where|when)(?:'s| is| are| was)\s+(?:a\s+|an\s+|the\s+)?\w+(?:\s+\w+){0,3}\??$",
    ]
    .into_iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Classify a query into a retrieval depth.
pub fn classify(query: &str) -> RetrievalDepth {
    let normalized = query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    if is_comprehensive(&normalized) {
        return RetrievalDepth::Comprehensive;
    }
    if is_quick(&normalized) {
        return RetrievalDepth::Quick;
    }

    let words = normalized.split(' ').filter(|w| !w.is_empty()).count();
    if words <= defaults::QUICK_MAX_WORDS {
        RetrievalDepth::Quick
    } else if words >= defaults::COMPREHENSIVE_MIN_WORDS {
        RetrievalDepth::Comprehensive
    } else {
        RetrievalDepth::Standard
    }
}

fn is_comprehensive(normalized: &str) -> bool {
    COMPREHENSIVE_PHRASES.iter().any(|p| normalized.contains(p))
        || COMPREHENSIVE_PATTERNS.iter().any(|re| re.is_match(normalized))
}

fn is_quick(normalized: &str) -> bool {
    QUICK_STARTERS.iter().any(|p| starts_with_phrase(normalized, p))
        || QUICK_RESOURCE_PHRASES.iter().any(|p| normalized.contains(p))
        || QUICK_PATTERNS.iter().any(|re| re.is_match(normalized))
}

/// `phrase` at the start of `text`, ending on a word boundary.
fn starts_with_phrase(text: &str, phrase: &str) -> bool {
    match text.strip_prefix(phrase) {
        Some(rest) => rest
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric()),
        None => false,
    }
}
