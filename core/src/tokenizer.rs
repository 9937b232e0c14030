//! Deterministic token counting and the static per-model cost table.
//!
//! The real tokenizer (a model-specific BPE vocabulary) is an out-of-scope
//! external collaborator; this module provides a deterministic
//! subword-approximation stand-in that every budget computation in the
//! crate is required to go through. A char-count heuristic exists purely
//! as a documented fallback and must never be wired into budget
//! enforcement.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Count tokens in `text` using a deterministic whitespace/punctuation-aware
/// subword approximation. All budget math (context aggregation, compression
/// triggers, cost estimation) must call this, never [`char_heuristic`].
pub fn count_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }

    let mut count = 0usize;
    let mut word_chars = 0usize;

    for ch in text.chars() {
        if ch.is_whitespace() {
            word_chars = 0;
            continue;
        }
        if ch.is_alphanumeric() {
            // Every 4th alphanumeric character inside a run starts a new
            // subword piece, approximating BPE's tendency to split long
            // words into multiple tokens.
            if word_chars % 4 == 0 {
                count += 1;
            }
            word_chars += 1;
        } else {
            // Punctuation and symbols are their own tokens.
            count += 1;
            word_chars = 0;
        }
    }

    count.max(1)
}

/// Character-count heuristic (`chars / 4`, rounded up). Documented
/// fallback only — never use this for budget enforcement.
pub fn char_heuristic(text: &str) -> usize {
    (text.chars().count() + 3) / 4
}

/// Per-million-token USD rates for a single model.
#[derive(Debug, Clone, Copy)]
pub struct ModelRate {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelRate {
    /// Estimate USD cost for the given token counts.
    pub fn estimate(&self, prompt_tokens: usize, completion_tokens: usize) -> f64 {
        (prompt_tokens as f64 / 1_000_000.0) * self.input_per_million
            + (completion_tokens as f64 / 1_000_000.0) * self.output_per_million
    }
}

fn cost_table() -> &'static HashMap<&'static str, ModelRate> {
    static TABLE: OnceLock<HashMap<&'static str, ModelRate>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = HashMap::new();
        table.insert(
            "openai/gpt-4o",
            ModelRate { input_per_million: 2.50, output_per_million: 10.00 },
        );
        table.insert(
            "openai/gpt-4o-mini",
            ModelRate { input_per_million: 0.15, output_per_million: 0.60 },
        );
        table.insert(
            "openai/gpt-4-turbo",
            ModelRate { input_per_million: 10.00, output_per_million: 30.00 },
        );
        table.insert(
            "anthropic/claude-opus",
            ModelRate { input_per_million: 15.00, output_per_million: 75.00 },
        );
        table.insert(
            "anthropic/claude-sonnet",
            ModelRate { input_per_million: 3.00, output_per_million: 15.00 },
        );
        table.insert(
            "anthropic/claude-haiku",
            ModelRate { input_per_million: 0.25, output_per_million: 1.25 },
        );
        table.insert(
            "gemini/gemini-1.5-pro",
            ModelRate { input_per_million: 1.25, output_per_million: 5.00 },
        );
        table.insert(
            "gemini/gemini-1.5-flash",
            ModelRate { input_per_million: 0.075, output_per_million: 0.30 },
        );
        table
    })
}

/// Look up the cost rates for `model` (form `"provider/model"`). Unknown
/// models default to a zero rate and log a warning, per spec: cost
/// accounting is advisory, never a hard gate on an unrecognized model.
pub fn rate_for(model: &str) -> ModelRate {
    match cost_table().get(model).copied() {
        Some(rate) => rate,
        None => {
            tracing::warn!(model, "no cost table entry for model, defaulting to zero rate");
            ModelRate { input_per_million: 0.0, output_per_million: 0.0 }
        }
    }
}

/// Estimate USD cost for a completed call.
pub fn estimate_cost(model: &str, prompt_tokens: usize, completion_tokens: usize) -> f64 {
    rate_for(model).estimate(prompt_tokens, completion_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_zero_tokens() {
        assert_eq!(count_tokens(""), 0);
    }

    #[test]
    fn counts_words_and_punctuation_separately() {
        let count = count_tokens("hello, world!");
        assert!(count >= 4);
    }

    #[test]
    fn unicode_text_counts_without_panicking() {
        let count = count_tokens("日本語のテキスト こんにちは");
        assert!(count > 0);
    }

    #[test]
    fn char_heuristic_is_never_used_by_count_tokens() {
        let text = "a b c d e f g h";
        assert_ne!(count_tokens(text), char_heuristic(text));
    }

    #[test]
    fn known_model_rate_is_exact() {
        let rate = rate_for("openai/gpt-4o-mini");
        assert_eq!(rate.input_per_million, 0.15);
    }

    #[test]
    fn unknown_model_defaults_to_zero_rate() {
        let rate = rate_for("unknown/unlisted-model");
        assert_eq!(rate.input_per_million, 0.0);
        assert_eq!(rate.output_per_million, 0.0);
    }

    #[test]
    fn cost_estimate_scales_with_tokens() {
        let cost = estimate_cost("openai/gpt-4o", 1_000_000, 0);
        assert!((cost - 2.50).abs() < 1e-9);
    }
}
