//! Wire and persistence DTOs: the shapes named in spec §3 and §6. HTTP
//! handlers and the CLI are out-of-scope external collaborators — this
//! module only defines the data they would exchange.

use serde::{Deserialize, Serialize};

/// One row of the `sessions` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub source: SessionSource,
    pub created_at: i64,
    pub last_active: i64,
    /// Opaque JSON, e.g. `{"pid": 1234}` for CLI sessions.
    pub metadata: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    Cli,
    Ui,
    Api,
}

impl std::fmt::Display for SessionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionSource::Cli => write!(f, "cli"),
            SessionSource::Ui => write!(f, "ui"),
            SessionSource::Api => write!(f, "api"),
        }
    }
}

/// One row of the `conversations` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: i64,
    pub timestamp: i64,
    pub agent: String,
    pub model: String,
    pub provider: String,
    pub prompt: String,
    pub response: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub duration_ms: f64,
    pub estimated_cost_usd: f64,
    pub fallback_used: bool,
    pub session_id: Option<String>,
    pub embedding: Option<Vec<u8>>,
}

/// A not-yet-persisted conversation, passed to `insert_conversation`.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub agent: String,
    pub model: String,
    pub provider: String,
    pub prompt: String,
    pub response: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub duration_ms: f64,
    pub estimated_cost_usd: f64,
    pub fallback_used: bool,
    pub session_id: Option<String>,
    pub embedding: Option<Vec<u8>>,
}

/// In-memory result of a single chain stage, produced by the Chain
/// Runtime. Distinct from [`ConversationRecord`]: this is the caller-facing
/// shape before (and independent of) persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub agent: String,
    pub model: String,
    pub provider: String,
    pub response: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub duration_ms: u64,
    pub estimated_cost_usd: f64,
    pub fallback_used: bool,
    pub fallback_reason: Option<String>,
    pub injected_context_tokens: usize,
    pub session_context_tokens: usize,
    pub knowledge_context_tokens: usize,
    pub session_id: Option<String>,
}

/// `POST /ask` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskRequest {
    pub agent: String,
    pub prompt: String,
    pub session_id: Option<String>,
    pub override_model: Option<String>,
}

/// `POST /chain` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainRequest {
    pub prompt: String,
    pub session_id: Option<String>,
    pub stages: Option<Vec<String>>,
}

/// `GET /memory/search` query parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySearchQuery {
    pub q: String,
    pub agent: Option<String>,
    pub limit: Option<usize>,
}

/// Per-agent/per-model cost and usage breakdown, used by `/metrics`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsBreakdown {
    pub key: String,
    pub request_count: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub avg_duration_ms: f64,
}

/// `GET /metrics` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub request_count: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub avg_duration_ms: f64,
    pub by_agent: Vec<MetricsBreakdown>,
    pub by_model: Vec<MetricsBreakdown>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Per-provider availability, keyed by provider id in [`HealthResponse::providers`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub available: bool,
    pub reason: Option<String>,
}

/// Memory subsystem health, embedded in [`HealthResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHealth {
    pub connected: bool,
    pub total_conversations: u64,
    pub db_size_mb: f64,
    pub last_conversation_at: Option<i64>,
}

/// `GET /health` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub providers: std::collections::BTreeMap<String, ProviderHealth>,
    pub memory: MemoryHealth,
    pub uptime_seconds: u64,
    pub last_request_at: Option<i64>,
    pub stats_24h: MetricsResponse,
}

/// Per-candidate outcome recorded while the LLM Connector walks the
/// fallback list, used in diagnostics and selection logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCandidateOutcome {
    pub model: String,
    pub provider: String,
    pub reason: Option<String>,
    pub succeeded: bool,
}

/// Structured critic-selection log emitted by §4.8.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionLog {
    pub selected: Vec<SelectedCritic>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedCritic {
    pub name: String,
    pub score: u32,
    pub from_fallback: bool,
}

/// Wire-stable compression summary fields (spec §6): field names are a
/// contract, never renamed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressionSummary {
    pub key_decisions: Vec<String>,
    pub rationale: std::collections::BTreeMap<String, String>,
    pub trade_offs: Vec<String>,
    pub open_questions: Vec<String>,
    pub technical_specs: std::collections::BTreeMap<String, String>,
}
