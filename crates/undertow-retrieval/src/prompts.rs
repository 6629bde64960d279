//! Prompt templates for the model-backed pipeline stages.
//!
//! System prompts are constants; user prompts are rendered from the
//! per-call inputs. Helpers at the bottom clean model output before parsing.

use undertow_core::{defaults, PrefetchSnapshot};

use crate::config::ClusterOptions;

// ============================================================================
// GATE
// ============================================================================

/// Conservative yes/no classifier for "is deeper search worth it".
pub const GATE_SYSTEM_PROMPT: &str = r#"You decide whether a background deep search of the user's knowledge base is worth running for their latest message. Should deep retrieval run?

Default to NO. Answer YES only when at least one of these holds:
- The message spans multiple topics or time periods.
- The user explicitly asks to find more, dig deeper, or look further back.
- The prefetched context is weak: no matches, or the best match scored low.
- The user asks for a comprehensive summary of past discussions or decisions.

Small talk, single facts, and questions already answered by strong prefetched matches are NO.

Reply with YES or NO, then one short sentence explaining why. Nothing else."#;

/// User prompt for the gate decision.
pub fn gate_user_prompt(query: &str, prefetch: &PrefetchSnapshot, recent_turns: &[String]) -> String {
    let top_score = prefetch
        .top_score
        .map(|s| format!("{:.2}", s))
        .unwrap_or_else(|| "none".to_string());

    format!(
        r#"Recent conversation:
{turns}

Prefetched context: {count} results, best similarity {top_score}

Latest message:
{query}"#,
        turns = render_turns(recent_turns),
        count = prefetch.result_count,
    )
}

// ============================================================================
// STRATEGY
// ============================================================================

/// Plan-generation instructions enumerating the capability surface.
pub const STRATEGY_SYSTEM_PROMPT: &str = r#"You plan a background search over the user's knowledge base. Output a retrieval plan as JSON and nothing else.

A plan is {"steps": [...]} where each step is an object with an "op" field. Steps run in order. Search steps write their results into a named slot ("into"); later steps read slots ("from"). The final step MUST be "return". Do not describe the plan, do not wrap it in a function: emit the steps directly.

OPERATIONS

semantic_search - meaning-based search.
  Use for: topics, concepts, paraphrased questions.
  Not for: exact names, ids, error codes.
  {"op":"semantic_search","query":"...","limit":20,"threshold":0.3,"into":"slot"}

keyword_grep - exact pattern match.
  Use for: names, product terms, ticket numbers, quoted phrases.
  Not for: vague topics.
  {"op":"keyword_grep","pattern":"...","case_sensitive":false,"limit":20,"into":"slot"}

search_by_time - items in a time window, optionally filtered by a query.
  Use for: "last week", "since March", "yesterday".
  since/until accept ISO dates or phrases like "yesterday", "last week", "3 days ago", "7d".
  {"op":"search_by_time","since":"last month","until":null,"query":"...","limit":50,"into":"slot"}

get_nodes - fetch items by id.
  {"op":"get_nodes","ids":["..."],"into":"slot"}

expand - follow graph links from every item in a slot.
  Use for: pulling in related context around strong hits.
  Not for: large slots; take the best few first.
  {"op":"expand","from":"slot","limit":10,"into":"slot"}

merge - concatenate slots.
  {"op":"merge","from":["a","b"],"into":"slot"}

dedupe - drop repeated items by id.
  {"op":"dedupe","from":"slot","into":"slot"}

filter - keep items at or above a similarity.
  {"op":"filter","from":"slot","min_similarity":0.5,"into":"slot"}

take - keep the first N items.
  {"op":"take","from":"slot","limit":10,"into":"slot"}

return - finish with a slot and your confidence (0 to 1) that it answers the request.
  {"op":"return","from":"slot","confidence":0.7,"summary":"optional one line"}

PATTERNS

Comprehensive summary: several semantic_search calls on the main facets, merge, dedupe, return.
Specific topic: semantic_search, take the top 5, expand, merge with the hits, dedupe, return.
Temporal: search_by_time with the window and a query, dedupe, return.
Entity mentions: keyword_grep on the exact name, expand, merge, dedupe, return.

Keep plans short. Never exceed 12 steps."#;

/// User prompt for strategy generation.
pub fn strategy_user_prompt(query: &str, gate_reason: &str, recent_turns: &[String]) -> String {
    format!(
        r#"Recent conversation:
{turns}

Why a deep search is running: {gate_reason}

Request:
{query}

Return the plan JSON."#,
        turns = render_turns(recent_turns),
    )
}

// ============================================================================
// CLUSTERING
// ============================================================================

/// Instructions for grouping index-addressed findings.
pub fn cluster_system_prompt(opts: &ClusterOptions) -> String {
    format!(
        r#"You organize search findings into themed clusters.

Rules:
- At most {max_clusters} clusters.
- At most {max_per_cluster} findings per cluster.
- A cluster needs at least {min_size} findings; put stragglers in "unclustered".
- Refer to findings only by their bracketed index number.
- Each index appears at most once across all clusters.

Respond with strict JSON only:
{{"method": "topic", "clusters": [{{"theme": "short label", "summary": "one or two sentences", "findingIds": [0, 3]}}], "unclustered": [5]}}

"method" is "topic", "temporal" or "hybrid" depending on how you grouped."#,
        max_clusters = opts.max_clusters,
        max_per_cluster = opts.max_per_cluster,
        min_size = opts.min_cluster_size,
    )
}

/// User prompt listing the presented findings. `bands` groups indices by
/// similarity band, highest first, and sets the listing order.
pub fn cluster_user_prompt(query: &str, bands: &[(String, Vec<(usize, &str)>)]) -> String {
    let mut listing = String::new();
    for (label, items) in bands {
        listing.push_str(&format!("## {}\n", label));
        for (index, content) in items {
            listing.push_str(&format!("[{}] {}\n", index, excerpt(content)));
        }
        listing.push('\n');
    }

    format!(
        r#"Search request: {query}

Findings:
{listing}Group the findings. JSON only."#
    )
}

// ============================================================================
// SYNTHESIS
// ============================================================================

/// Instructions for the conversational follow-up.
pub const SYNTHESIS_SYSTEM_PROMPT: &str = r#"You are the assistant following up in an ongoing conversation. A background search just finished and you are sharing what it turned up.

Write 2 to 4 sentences in a natural, conversational voice. Mention the most useful themes and one concrete detail. Do not repeat or summarize what you already said in your previous turn. Do not use lists, headings, or markdown. Do not mention searching, clusters, or tools."#;

/// User prompt carrying the cluster digest.
pub fn synthesis_user_prompt(query: &str, digest: &str, recent_turns: &[String]) -> String {
    format!(
        r#"Recent conversation:
{turns}

Original request: {query}

What the background search found:
{digest}

Write the follow-up."#,
        turns = render_turns(recent_turns),
    )
}

// ============================================================================
// HELPERS
// ============================================================================

fn render_turns(turns: &[String]) -> String {
    if turns.is_empty() {
        return "(none)".to_string();
    }
    turns
        .iter()
        .map(|t| format!("- {}", excerpt(t)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// First [`PROMPT_EXCERPT_CHARS`](defaults::PROMPT_EXCERPT_CHARS) characters of `text`
/// on a single line.
pub fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= defaults::PROMPT_EXCERPT_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(defaults::PROMPT_EXCERPT_CHARS).collect();
    format!("{}…", cut.trim_end())
}

/// Remove a surrounding markdown code fence, if any.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "javascript", ...).
    let body = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Locate the first well-formed JSON object or array in free-form model output.
///
/// Every `{` or `[` is tried in order, so bracketed prose ahead of the payload
/// ("Plan [v1] below:") is skipped.
pub fn extract_json(text: &str) -> Option<&str> {
    let text = strip_code_fences(text);
    text.match_indices(['{', '[']).find_map(|(start, _)| {
        let rest = &text[start..];
        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<serde_json::Value>();
        match stream.next() {
            Some(Ok(_)) => Some(&rest[..stream.byte_offset()]),
            _ => None,
        }
    })
}
