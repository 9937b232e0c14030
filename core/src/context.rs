//! Context Aggregator: the dual-context retrieval model (session slice +
//! knowledge slice) under a token budget.

use crate::config::{MemoryConfig, MemoryStrategy};
use crate::embedding;
use crate::protocol::ConversationRecord;
use crate::store::ConversationStore;
use crate::tokenizer::count_tokens;
use std::collections::HashSet;

/// Telemetry reported alongside the formatted context block.
#[derive(Debug, Clone, Default)]
pub struct ContextTelemetry {
    pub session_tokens: usize,
    pub knowledge_tokens: usize,
    pub total_tokens: usize,
    pub session_messages: usize,
    pub knowledge_messages: usize,
}

const KNOWLEDGE_CANDIDATE_POOL: usize = 50;
const KNOWLEDGE_RESPONSE_TRUNCATE_CHARS: usize = 300;

/// Build the formatted context block and telemetry for `prompt` within
/// `session_id`, per the agent's memory config.
pub async fn aggregate(
    store: &ConversationStore,
    agent: &str,
    prompt: &str,
    session_id: Option<&str>,
    config: &MemoryConfig,
) -> (String, ContextTelemetry) {
    let budget = config.max_context_tokens;
    let mut telemetry = ContextTelemetry::default();

    let session_section = session_id
        .map(|sid| build_session_slice(store, sid, config, budget, &mut telemetry))
        .unwrap_or_default();

    let knowledge_section =
        build_knowledge_slice(store, agent, prompt, session_id, config, budget, &mut telemetry).await;

    telemetry.total_tokens = telemetry.session_tokens + telemetry.knowledge_tokens;

    if session_section.is_empty() && knowledge_section.is_empty() {
        return (String::new(), telemetry);
    }

    let mut block = String::new();
    if !session_section.is_empty() {
        block.push_str("=== Session context ===\n");
        block.push_str(&session_section);
        block.push('\n');
    }
    if !knowledge_section.is_empty() {
        block.push_str("=== Related knowledge ===\n");
        block.push_str(&knowledge_section);
    }
    (block, telemetry)
}

fn build_session_slice(
    store: &ConversationStore,
    session_id: &str,
    config: &MemoryConfig,
    budget: usize,
    telemetry: &mut ContextTelemetry,
) -> String {
    let records = match store.get_recent_by_session(session_id, config.session_limit) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "session slice lookup failed, continuing with empty context");
            return String::new();
        }
    };

    let session_budget = (budget as f64 * 0.75).floor() as usize;
    let formatted: Vec<String> = records.iter().map(format_session_turn).collect();

    // Trim from the front (oldest) until the slice fits the session budget.
    let mut start = 0;
    loop {
        let remaining = &formatted[start..];
        let tokens: usize = remaining.iter().map(|t| count_tokens(t)).sum();
        if tokens <= session_budget || remaining.is_empty() {
            telemetry.session_tokens = tokens;
            telemetry.session_messages = remaining.len();
            return remaining.join("\n");
        }
        start += 1;
    }
}

fn format_session_turn(record: &ConversationRecord) -> String {
    format!("[{}] {}\n-> {}", record.agent, record.prompt, record.response)
}

async fn build_knowledge_slice(
    store: &ConversationStore,
    agent: &str,
    prompt: &str,
    session_id: Option<&str>,
    config: &MemoryConfig,
    budget: usize,
    telemetry: &mut ContextTelemetry,
) -> String {
    let candidates = match if config.exclude_same_agent {
        store.query_candidates_excluding_agent(agent, session_id, KNOWLEDGE_CANDIDATE_POOL)
    } else {
        store.query_candidates(agent, session_id, KNOWLEDGE_CANDIDATE_POOL)
    } {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "knowledge slice lookup failed, continuing with empty context");
            return String::new();
        }
    };
    if candidates.is_empty() {
        return String::new();
    }

    let prompt_embedding = if config.strategy != MemoryStrategy::Keywords {
        embedding::embed(prompt).await
    } else {
        None
    };
    let prompt_keywords = tokenize_keywords(prompt);

    let mut scored: Vec<(f32, ConversationRecord)> = Vec::with_capacity(candidates.len());
    for mut candidate in candidates {
        let age_hours = ((chrono::Utc::now().timestamp() - candidate.timestamp) as f32 / 3600.0).max(0.0);
        let decay = (-age_hours / config.time_decay_hours).exp();

        let score = match config.strategy {
            MemoryStrategy::Semantic => semantic_score(store, &mut candidate, prompt_embedding.as_deref()).await * decay,
            MemoryStrategy::Keywords => keyword_score(&prompt_keywords, &candidate.prompt) * decay,
            MemoryStrategy::Hybrid => {
                let semantic = semantic_score(store, &mut candidate, prompt_embedding.as_deref()).await;
                let keyword = keyword_score(&prompt_keywords, &candidate.prompt);
                (0.7 * semantic + 0.3 * keyword) * decay
            }
        };

        candidate.response = truncate_chars(&candidate.response, KNOWLEDGE_RESPONSE_TRUNCATE_CHARS);
        scored.push((score, candidate));
    }

    let mut relevant: Vec<(f32, ConversationRecord)> =
        scored.iter().filter(|(s, _)| *s >= config.min_relevance).cloned().collect();

    if relevant.is_empty() {
        // Fall back to the single most recent candidate across the pool,
        // with a minimal sentinel score, per spec §4.6 step 4.
        if let Some((_, fallback)) = scored
            .into_iter()
            .max_by_key(|(_, c)| (c.timestamp, c.id))
        {
            tracing::info!(agent, "knowledge slice empty after filtering, falling back to most recent candidate");
            relevant.push((f32::MIN, fallback));
        } else {
            return String::new();
        }
    }

    relevant.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.1.timestamp.cmp(&a.1.timestamp))
            .then_with(|| b.1.id.cmp(&a.1.id))
    });

    let mut lines = Vec::new();
    let mut knowledge_tokens = 0usize;
    for (_, record) in relevant {
        let line = format!("[{}] {}\n-> {}", record.agent, record.prompt, record.response);
        let line_tokens = count_tokens(&line);
        if telemetry.session_tokens + knowledge_tokens + line_tokens > budget {
            break;
        }
        knowledge_tokens += line_tokens;
        lines.push(line);
    }

    telemetry.knowledge_tokens = knowledge_tokens;
    telemetry.knowledge_messages = lines.len();
    lines.join("\n")
}

/// Score a candidate against the prompt embedding, lazily generating and
/// persisting the candidate's own embedding if it is missing (spec §4.6
/// step 3: "Missing embeddings are lazily generated and persisted via
/// update_embedding").
async fn semantic_score(store: &ConversationStore, candidate: &mut ConversationRecord, prompt_embedding: Option<&[f32]>) -> f32 {
    let Some(prompt_vec) = prompt_embedding else { return 0.0 };

    let candidate_vec = match candidate.embedding.as_deref().and_then(embedding::deserialize) {
        Some(v) => Some(v),
        None => {
            let text = format!("{} {}", candidate.prompt, candidate.response);
            match embedding::embed(&text).await {
                Some(v) => {
                    let blob = embedding::serialize(&v);
                    if let Err(e) = store.update_embedding(candidate.id, &blob) {
                        tracing::warn!(error = %e, id = candidate.id, "failed to backfill embedding");
                    }
                    candidate.embedding = Some(blob);
                    Some(v)
                }
                None => None,
            }
        }
    };

    match candidate_vec {
        Some(v) => embedding::cosine(prompt_vec, &v),
        None => 0.0,
    }
}

fn keyword_score(prompt_keywords: &HashSet<String>, candidate_prompt: &str) -> f32 {
    if prompt_keywords.is_empty() {
        return 0.0;
    }
    let candidate_keywords = tokenize_keywords(candidate_prompt);
    let overlap = prompt_keywords.intersection(&candidate_keywords).count();
    overlap as f32 / prompt_keywords.len() as f32
}

fn tokenize_keywords(text: &str) -> HashSet<String> {
    text.to_lowercase().split_whitespace().map(str::to_string).collect()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NewConversation;

    fn config() -> MemoryConfig {
        MemoryConfig {
            strategy: MemoryStrategy::Keywords,
            session_limit: 10,
            min_relevance: 0.1,
            time_decay_hours: 72.0,
            max_context_tokens: 2000,
            exclude_same_agent: false,
        }
    }

    fn insert(store: &ConversationStore, agent: &str, session_id: Option<&str>, prompt: &str, response: &str) -> i64 {
        store
            .insert_conversation(NewConversation {
                agent: agent.to_string(),
                model: "openai/gpt-4o".to_string(),
                provider: "openai".to_string(),
                prompt: prompt.to_string(),
                response: response.to_string(),
                prompt_tokens: 5,
                completion_tokens: 5,
                duration_ms: 1.0,
                estimated_cost_usd: 0.0,
                fallback_used: false,
                session_id: session_id.map(str::to_string),
                embedding: None,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn empty_store_yields_empty_context() {
        let store = ConversationStore::open_in_memory().unwrap();
        let (block, telemetry) = aggregate(&store, "builder", "hello", None, &config()).await;
        assert!(block.is_empty());
        assert_eq!(telemetry.total_tokens, 0);
    }

    #[tokio::test]
    async fn session_slice_is_oldest_first() {
        let store = ConversationStore::open_in_memory().unwrap();
        insert(&store, "builder", Some("s1"), "first", "resp1");
        insert(&store, "builder", Some("s1"), "second", "resp2");
        let (block, telemetry) = aggregate(&store, "builder", "question", Some("s1"), &config()).await;
        let first_pos = block.find("first").unwrap();
        let second_pos = block.find("second").unwrap();
        assert!(first_pos < second_pos);
        assert_eq!(telemetry.session_messages, 2);
    }

    #[tokio::test]
    async fn knowledge_slice_excludes_current_session() {
        let store = ConversationStore::open_in_memory().unwrap();
        insert(&store, "builder", Some("other"), "rust async runtime", "tokio is great");
        let (block, telemetry) = aggregate(&store, "builder", "rust async runtime question", Some("s1"), &config()).await;
        assert!(block.contains("tokio is great"));
        assert_eq!(telemetry.knowledge_messages, 1);
    }

    #[tokio::test]
    async fn falls_back_to_most_recent_when_nothing_clears_min_relevance() {
        let store = ConversationStore::open_in_memory().unwrap();
        insert(&store, "builder", None, "completely unrelated topic", "some response");
        let mut cfg = config();
        cfg.min_relevance = 0.99;
        let (block, telemetry) = aggregate(&store, "builder", "something else entirely", None, &cfg).await;
        assert!(block.contains("some response"));
        assert_eq!(telemetry.knowledge_messages, 1);
    }
}
