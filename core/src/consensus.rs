//! Consensus Merger: aggregates critic outputs into one weighted review
//! artifact plus a synthetic `multi-critic` RunResult.

use crate::protocol::RunResult;
use crate::tokenizer::count_tokens;

/// A single critic's completed contribution, paired with its configured
/// weight for ordering and the priority marker.
#[derive(Debug, Clone)]
pub struct CriticContribution {
    pub name: String,
    pub weight: f32,
    pub result: RunResult,
}

const PRIORITY_WEIGHT_THRESHOLD: f32 = 1.5;

/// Merge critic contributions into a single review text and a synthetic
/// `multi-critic` [`RunResult`]. Returns `None` if `contributions` is
/// empty — the caller treats that as `AllCriticsFailed`.
pub fn merge(contributions: &[CriticContribution], session_id: Option<&str>) -> Option<(String, RunResult)> {
    if contributions.is_empty() {
        return None;
    }

    let mut ordered: Vec<&CriticContribution> = contributions.iter().collect();
    ordered.sort_by(|a, b| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });

    let mut review = String::new();
    let mut total_prompt_tokens = 0u32;
    let mut total_completion_tokens = 0u32;
    let mut total_duration_ms = 0u64;
    let mut total_cost = 0.0f64;
    let mut responses = Vec::with_capacity(ordered.len());

    for contribution in &ordered {
        let marker = if contribution.weight >= PRIORITY_WEIGHT_THRESHOLD { " [PRIORITY]" } else { "" };
        review.push_str(&format!("## {}{}\n{}\n\n", contribution.name, marker, contribution.result.response));

        total_prompt_tokens += contribution.result.prompt_tokens;
        total_completion_tokens += contribution.result.completion_tokens;
        total_duration_ms += contribution.result.duration_ms;
        total_cost += contribution.result.estimated_cost_usd;
        responses.push(contribution.result.response.clone());
    }

    let tokens_per_critic: Vec<String> = ordered
        .iter()
        .map(|c| format!("{}={}", c.name, count_tokens(&c.result.response)))
        .collect();
    review.push_str(&format!("Summary: {} critics reviewed. Tokens per critic: {}.\n", ordered.len(), tokens_per_critic.join(", ")));

    let synthetic = RunResult {
        agent: "multi-critic".to_string(),
        model: "multi-critic".to_string(),
        provider: "multi-critic".to_string(),
        response: review.clone(),
        prompt_tokens: total_prompt_tokens,
        completion_tokens: total_completion_tokens,
        total_tokens: total_prompt_tokens + total_completion_tokens,
        duration_ms: total_duration_ms,
        estimated_cost_usd: total_cost,
        fallback_used: ordered.iter().any(|c| c.result.fallback_used),
        fallback_reason: None,
        injected_context_tokens: 0,
        session_context_tokens: 0,
        knowledge_context_tokens: 0,
        session_id: session_id.map(str::to_string),
    };

    Some((review, synthetic))
}
