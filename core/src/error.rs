//! Structured error types for the orchestration engine.
//!
//! Every variant maps to one of the spec's error classes and, through
//! [`OrchestratorError::cli_exit_code`], to a CLI exit code.

use thiserror::Error;

/// A single provider candidate's failure reason, carried by
/// [`OrchestratorError::AllProvidersFailed`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CandidateFailure {
    pub model: String,
    pub reason: String,
}

/// Primary error type for orchestration operations.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Malformed request, missing field, or an invalid session id.
    #[error("invalid input: {message}")]
    InvalidInput { message: String },

    /// `session_id` failed the `^[A-Za-z0-9_-]{1,64}$` validation.
    #[error("invalid session id: {session_id}")]
    InvalidSessionId { session_id: String },

    /// Agent or model reference could not be resolved at startup.
    #[error("configuration error: {message}")]
    ConfigError { message: String },

    /// Every fallback candidate for a model failed.
    #[error("all providers failed for {requested_model}: {candidates:?}")]
    AllProvidersFailed {
        requested_model: String,
        candidates: Vec<CandidateFailure>,
    },

    /// A required chain stage (builder/closer) could not complete.
    #[error("stage failed: {stage}: {cause}")]
    StageFailed { stage: String, cause: String },

    /// Zero critics produced a usable response during a critic stage.
    #[error("all critics failed")]
    AllCriticsFailed,

    /// Persistence failure. Non-fatal for retrieval paths (memory is
    /// best-effort) but surfaced for writes metrics/accounting depend on.
    #[error("store error: {0}")]
    StoreError(String),

    /// A record lookup found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transient network/5xx/rate-limit condition. Handled locally by the
    /// connector's retry loop; only escalates into `AllProvidersFailed`
    /// once retries are exhausted for every candidate.
    #[error("transient error: {0}")]
    Transient(String),
}

impl OrchestratorError {
    /// CLI exit code per the external interface contract.
    pub fn cli_exit_code(&self) -> i32 {
        match self {
            Self::InvalidInput { .. } | Self::InvalidSessionId { .. } => 2,
            Self::ConfigError { .. } => 3,
            Self::AllProvidersFailed { .. } => 4,
            Self::StoreError(_) | Self::NotFound(_) => 5,
            Self::StageFailed { .. } | Self::AllCriticsFailed | Self::Transient(_) => 1,
        }
    }

    /// Whether this error class is safe to retry without caller
    /// intervention (used by the connector's own retry bookkeeping, not
    /// a general-purpose predicate for the whole chain).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        Self::StoreError(err.to_string())
    }
}

impl From<rusqlite::Error> for OrchestratorError {
    fn from(err: rusqlite::Error) -> Self {
        Self::StoreError(err.to_string())
    }
}

/// Result type alias using [`OrchestratorError`].
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(
            OrchestratorError::InvalidInput { message: "x".into() }.cli_exit_code(),
            2
        );
        assert_eq!(
            OrchestratorError::ConfigError { message: "x".into() }.cli_exit_code(),
            3
        );
        assert_eq!(
            OrchestratorError::AllProvidersFailed {
                requested_model: "openai/gpt-4".into(),
                candidates: vec![],
            }
            .cli_exit_code(),
            4
        );
        assert_eq!(OrchestratorError::StoreError("x".into()).cli_exit_code(), 5);
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(OrchestratorError::Transient("timeout".into()).is_retryable());
        assert!(!OrchestratorError::AllCriticsFailed.is_retryable());
    }
}
