//! LLM Connector: `call(model, system, user, temperature, max_tokens, retries)`
//! with provider fallback, retry, cost accounting, and credential masking.
//!
//! Grounded in the teacher's `llm::client::LlmClient`
//! (`core/src/llm/client.rs`): the request/retry/header plumbing is kept,
//! generalized from the teacher's single-configured-provider model to the
//! spec's per-call candidate list built from `[model] ++ fallback_models`.

pub mod chat;
pub mod client;

pub use chat::{ChatMessage, MessageRole, TokenUsage};
pub use client::LlmConnector;

use serde::{Deserialize, Serialize};

/// Global connector settings: network timeout and retry/backoff schedule.
/// Per-call parameters (model, temperature, max_tokens, fallback list) are
/// arguments to [`LlmConnector::call`], not part of this config, since the
/// same connector instance serves every agent.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub request_timeout_secs: u64,
    pub retry: crate::config::RetryConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 120,
            retry: crate::config::RetryConfig::default(),
        }
    }
}

/// Outcome of a successful [`LlmConnector::call`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub provider: String,
    pub requested_model: String,
    pub model_used: String,
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub duration_ms: u64,
    pub cost_usd: f64,
    pub fallback_used: bool,
    /// Why the originally requested model was skipped, when `fallback_used`
    /// is true (e.g. `"missing_credential"`). `None` when the requested
    /// model itself served the call.
    pub fallback_reason: Option<String>,
}
