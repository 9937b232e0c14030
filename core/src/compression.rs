//! Semantic Compressor: reduces a prior stage's output to a compact
//! structured summary, falling back to sentence-aware truncation.

use crate::config::CompressionConfig;
use crate::llm::LlmConnector;
use crate::protocol::CompressionSummary;
use crate::tokenizer::count_tokens;

/// Which agent class triggered compression, selecting the threshold to
/// apply (spec §4.7: standard ≥ 1200, memory-enabled ≥ 800, closer ≥ 1500).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerClass {
    Standard,
    MemoryEnabled,
    Closer,
}

/// Whether `text` is long enough to trigger compression for the given
/// agent class.
pub fn should_compress(text: &str, class: TriggerClass, config: &CompressionConfig) -> bool {
    let threshold = match class {
        TriggerClass::Standard => config.standard_threshold_chars,
        TriggerClass::MemoryEnabled => config.memory_enabled_threshold_chars,
        TriggerClass::Closer => config.closer_threshold_chars,
    };
    text.chars().count() >= threshold
}

const COMPRESSION_SYSTEM_PROMPT: &str = "You compress engineering discussion into a structured summary. \
Respond with a single JSON object with exactly these fields: key_decisions (array of strings), \
rationale (object mapping topic to explanation), trade_offs (array of strings), \
open_questions (array of strings), technical_specs (object mapping name to value). \
Respond with JSON only, no prose.";

/// Compress `text` if it exceeds `class`'s threshold, otherwise return it
/// unchanged. On a structured-summary failure, falls back to
/// sentence-aware truncation at `config.target_tokens`.
pub async fn compress(connector: &LlmConnector, text: &str, class: TriggerClass, config: &CompressionConfig) -> String {
    if !should_compress(text, class, config) {
        return text.to_string();
    }

    match compress_structured(connector, text, config).await {
        Some(summary) => render_summary(&summary),
        None => truncate_sentence_aware(text, config.target_tokens),
    }
}

async fn compress_structured(connector: &LlmConnector, text: &str, config: &CompressionConfig) -> Option<CompressionSummary> {
    let response = connector
        .call(&config.model, COMPRESSION_SYSTEM_PROMPT, text, 0.1, (config.target_tokens as u32) * 2, &[], None, None)
        .await
        .ok()?;

    serde_json::from_str(&response.text).ok()
}

fn render_summary(summary: &CompressionSummary) -> String {
    let mut out = String::new();
    if !summary.key_decisions.is_empty() {
        out.push_str("Key decisions:\n");
        for item in &summary.key_decisions {
            out.push_str("- ");
            out.push_str(item);
            out.push('\n');
        }
    }
    if !summary.rationale.is_empty() {
        out.push_str("Rationale:\n");
        for (topic, explanation) in &summary.rationale {
            out.push_str(&format!("- {topic}: {explanation}\n"));
        }
    }
    if !summary.trade_offs.is_empty() {
        out.push_str("Trade-offs:\n");
        for item in &summary.trade_offs {
            out.push_str("- ");
            out.push_str(item);
            out.push('\n');
        }
    }
    if !summary.open_questions.is_empty() {
        out.push_str("Open questions:\n");
        for item in &summary.open_questions {
            out.push_str("- ");
            out.push_str(item);
            out.push('\n');
        }
    }
    if !summary.technical_specs.is_empty() {
        out.push_str("Technical specs:\n");
        for (name, value) in &summary.technical_specs {
            out.push_str(&format!("- {name}: {value}\n"));
        }
    }
    out
}

/// Keep whole sentences from the start until the remainder fits in
/// `target_tokens`.
fn truncate_sentence_aware(text: &str, target_tokens: usize) -> String {
    let sentences = split_sentences(text);
    let mut kept = String::new();

    for sentence in sentences {
        let candidate = if kept.is_empty() { sentence.clone() } else { format!("{kept} {sentence}") };
        if count_tokens(&candidate) > target_tokens && !kept.is_empty() {
            break;
        }
        kept = candidate;
    }

    if kept.is_empty() {
        kept = text.to_string();
    }
    kept
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if ch == '.' || ch == '!' || ch == '?' {
            sentences.push(current.trim().to_string());
            current = String::new();
        }
    }
    if !current.trim().is_empty() {
        sentences.push(current.trim().to_string());
    }
    sentences.into_iter().filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_never_triggers() {
        let config = CompressionConfig::default();
        assert!(!should_compress("short text", TriggerClass::Standard, &config));
    }

    #[test]
    fn memory_enabled_threshold_is_lower_than_standard() {
        let config = CompressionConfig::default();
        let text = "a".repeat(1000);
        assert!(should_compress(&text, TriggerClass::MemoryEnabled, &config));
        assert!(!should_compress(&text, TriggerClass::Standard, &config));
    }

    #[test]
    fn sentence_truncation_keeps_whole_sentences() {
        let text = "First sentence is here. Second sentence follows. Third one too.";
        let truncated = truncate_sentence_aware(text, 6);
        assert!(truncated.ends_with('.'));
        assert!(!truncated.contains("Third"));
    }

    #[test]
    fn sentence_truncation_keeps_at_least_one_sentence() {
        let text = "A single very long sentence that alone exceeds the tiny budget given to it.";
        let truncated = truncate_sentence_aware(text, 1);
        assert!(!truncated.is_empty());
    }

    #[test]
    fn render_summary_includes_all_wire_stable_sections() {
        let mut summary = CompressionSummary::default();
        summary.key_decisions.push("use rusqlite".to_string());
        summary.trade_offs.push("simpler ops, weaker concurrency".to_string());
        let rendered = render_summary(&summary);
        assert!(rendered.contains("Key decisions"));
        assert!(rendered.contains("Trade-offs"));
    }
}
