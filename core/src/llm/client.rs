//! LLM Connector backend: candidate fallback, retry with backoff, and the
//! two wire formats (OpenAI-compatible, Gemini) the registered providers
//! speak, behind a `ProviderAdapter` trait (spec §4.1 supplement) so the
//! connector's fallback/retry logic stays provider-agnostic.
//!
//! `retry_with_backoff` is carried over near-verbatim from the teacher's
//! `LlmClient` (`core/src/llm/client.rs`); the adapter split and the call
//! contract around it are new, built to the spec's per-call candidate
//! list rather than the teacher's single-configured-provider client.

use super::chat::{ChatMessage, MessageRole};
use super::{LlmConfig, Response};
use crate::config::RetryConfig;
use crate::error::{CandidateFailure, OrchestratorError, Result};
use crate::provider;
use crate::tokenizer;
use crate::util::{sanitize_base_url, validate_api_key};
use async_trait::async_trait;
use rand::Rng;
use reqwest::{
    header::{HeaderMap, CONTENT_TYPE},
    Client as HttpClient, StatusCode,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// One request, shaped for any [`ProviderAdapter`] regardless of wire
/// format.
pub struct AdapterRequest<'a> {
    pub base_url: &'a str,
    pub api_key: &'a str,
    pub model_name: &'a str,
    pub system: &'a str,
    pub user: &'a str,
    pub temperature: f32,
    pub max_tokens: u32,
    pub retries: u32,
}

/// A single provider's wire protocol: given a request, produce completion
/// text or a failure reason string matching spec §4.1's reason taxonomy
/// (`empty_response`, `content_filtered`, `auth_failed`, `transient`).
/// Object-safe so the connector can select an adapter at runtime by
/// provider id without generics leaking into `LlmConnector::call`.
#[async_trait]
trait ProviderAdapter: Send + Sync {
    async fn invoke(&self, http_client: &HttpClient, retry: &RetryConfig, req: AdapterRequest<'_>, cancel: Option<&CancellationToken>) -> std::result::Result<String, String>;
}

/// Provider-fallback LLM connector. One instance is shared for the
/// process lifetime (spec §5: singleton, process-lifetime I/O owner).
pub struct LlmConnector {
    http_client: HttpClient,
    config: LlmConfig,
}

impl LlmConnector {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent("orchestrator/0.1")
            .build()
            .map_err(|e| OrchestratorError::ConfigError { message: format!("failed to build HTTP client: {e}") })?;
        Ok(Self { http_client, config })
    }

    /// `call(model, system, user, temperature, max_tokens, retries)`.
    ///
    /// Builds the candidate list `[model] ++ fallback_models` and tries
    /// each in order, skipping disabled/uncredentialed providers without
    /// spending a network round trip, and retrying transient failures on
    /// each live candidate before moving to the next.
    pub async fn call(
        &self,
        model: &str,
        system: &str,
        user: &str,
        temperature: f32,
        max_tokens: u32,
        fallback_models: &[String],
        retries: Option<u32>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Response> {
        let mut candidates = Vec::with_capacity(1 + fallback_models.len());
        candidates.push(model.to_string());
        candidates.extend(fallback_models.iter().cloned());

        let retries = retries.unwrap_or(self.config.retry.max_retries);
        let mut failures = Vec::new();

        for candidate in &candidates {
            let Some((provider_id, model_name)) = provider::split_model_ref(candidate) else {
                failures.push(CandidateFailure { model: candidate.clone(), reason: "missing_credential".to_string() });
                continue;
            };

            if provider::is_disabled(provider_id) {
                failures.push(CandidateFailure { model: candidate.clone(), reason: "provider_disabled".to_string() });
                continue;
            }
            if !provider::has_credential(provider_id) {
                failures.push(CandidateFailure { model: candidate.clone(), reason: "missing_credential".to_string() });
                continue;
            }

            let started = std::time::Instant::now();
            let outcome: std::result::Result<String, String> = async {
                let info = provider::resolve(provider_id).ok_or_else(|| "missing_credential".to_string())?;
                let api_key = std::env::var(&info.credential_env).unwrap_or_default();
                let req = AdapterRequest {
                    base_url: &info.default_base_url,
                    api_key: &api_key,
                    model_name,
                    system,
                    user,
                    temperature,
                    max_tokens,
                    retries,
                };
                self.adapter_for(provider_id).invoke(&self.http_client, &self.config.retry, req, cancel).await
            }
            .await;

            match outcome {
                Ok(text) if !text.trim().is_empty() => {
                    let prompt_tokens = tokenizer::count_tokens(system) + tokenizer::count_tokens(user);
                    let completion_tokens = tokenizer::count_tokens(&text);
                    let cost_usd = tokenizer::estimate_cost(candidate, prompt_tokens, completion_tokens);
                    let fallback_used = candidate != model;
                    if fallback_used {
                        tracing::warn!(requested_model = model, model_used = %candidate, "provider fallback used");
                    }
                    return Ok(Response {
                        provider: provider_id.to_string(),
                        requested_model: model.to_string(),
                        model_used: candidate.clone(),
                        text,
                        prompt_tokens: prompt_tokens as u32,
                        completion_tokens: completion_tokens as u32,
                        total_tokens: (prompt_tokens + completion_tokens) as u32,
                        duration_ms: started.elapsed().as_millis() as u64,
                        cost_usd,
                        fallback_used,
                        fallback_reason: failures.first().map(|f| f.reason.clone()),
                    });
                }
                Ok(_) => {
                    failures.push(CandidateFailure { model: candidate.clone(), reason: "empty_response".to_string() });
                }
                Err(reason) => {
                    failures.push(CandidateFailure { model: candidate.clone(), reason });
                }
            }
        }

        Err(OrchestratorError::AllProvidersFailed {
            requested_model: model.to_string(),
            candidates: failures,
        })
    }

    /// Picks the adapter for a resolved provider. `LLM_MOCK=1` takes
    /// priority over everything so tests never depend on which provider
    /// a model string happens to resolve to.
    fn adapter_for(&self, provider_id: &str) -> Box<dyn ProviderAdapter> {
        if provider::is_mock_mode() {
            Box::new(MockAdapter)
        } else if provider_id == "gemini" {
            Box::new(GeminiAdapter)
        } else {
            Box::new(OpenAiCompatibleAdapter)
        }
    }
}

/// Deterministic canned reply for `LLM_MOCK=1`, used by integration tests
/// that must not reach the network.
struct MockAdapter;

#[async_trait]
impl ProviderAdapter for MockAdapter {
    async fn invoke(&self, _http_client: &HttpClient, _retry: &RetryConfig, req: AdapterRequest<'_>, _cancel: Option<&CancellationToken>) -> std::result::Result<String, String> {
        Ok(format!("[mock response] system_len={} user_len={}", req.system.chars().count(), req.user.chars().count()))
    }
}

struct OpenAiCompatibleAdapter;

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleAdapter {
    async fn invoke(&self, http_client: &HttpClient, retry: &RetryConfig, req: AdapterRequest<'_>, cancel: Option<&CancellationToken>) -> std::result::Result<String, String> {
        let base_url = sanitize_base_url(req.base_url, "base_url").map_err(|e| e.to_string())?;
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "application/json".parse().map_err(|_| "auth_failed".to_string())?);
        let validated_key = validate_api_key(req.api_key).map_err(|_| "auth_failed".to_string())?;
        let auth_value = format!("Bearer {}", validated_key);
        headers.insert("Authorization", auth_value.parse().map_err(|_| "auth_failed".to_string())?);

        let body = OpenAiRequest {
            model: req.model_name.to_string(),
            messages: vec![
                OpenAiMessage { role: "system".to_string(), content: req.system.to_string() },
                OpenAiMessage { role: "user".to_string(), content: req.user.to_string() },
            ],
            max_tokens: req.max_tokens,
            temperature: req.temperature,
        };

        let response = retry_with_backoff(retry, req.retries, cancel, || {
            http_client.post(&url).headers(headers.clone()).json(&body).send()
        })
        .await?;

        match response.status() {
            StatusCode::OK => {
                let text = response.text().await.map_err(|e| e.to_string())?;
                let parsed: OpenAiResponse = serde_json::from_str(&text).map_err(|e| format!("empty_response: {e}"))?;
                let choice = parsed.choices.into_iter().next();
                match choice {
                    Some(c) if matches!(c.finish_reason.as_deref(), Some("content_filter") | Some("safety")) => {
                        Err("content_filtered".to_string())
                    }
                    Some(c) => Ok(c.message.content),
                    None => Err("empty_response".to_string()),
                }
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err("auth_failed".to_string()),
            _ => Err("empty_response".to_string()),
        }
    }
}

struct GeminiAdapter;

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    async fn invoke(&self, http_client: &HttpClient, retry: &RetryConfig, req: AdapterRequest<'_>, cancel: Option<&CancellationToken>) -> std::result::Result<String, String> {
        let base_url = sanitize_base_url(req.base_url, "base_url").map_err(|e| e.to_string())?;
        let url = format!("{}/models/{}:generateContent?key={}", base_url.trim_end_matches('/'), req.model_name, req.api_key);

        let body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart { text: format!("SYSTEM INSTRUCTIONS:\n{}\n\nUSER MESSAGE:\n{}", req.system, req.user) }],
            }],
            generation_config: GeminiGenerationConfig { max_output_tokens: req.max_tokens, temperature: req.temperature },
        };

        let response = retry_with_backoff(retry, req.retries, cancel, || {
            http_client.post(&url).header(CONTENT_TYPE, "application/json").json(&body).send()
        })
        .await?;

        match response.status() {
            StatusCode::OK => {
                let text = response.text().await.map_err(|e| e.to_string())?;
                let parsed: GeminiResponse = serde_json::from_str(&text).map_err(|e| format!("empty_response: {e}"))?;
                parsed
                    .candidates
                    .into_iter()
                    .next()
                    .and_then(|c| c.content.parts.into_iter().next())
                    .map(|p| p.text)
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| "empty_response".to_string())
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err("auth_failed".to_string()),
            _ => Err("empty_response".to_string()),
        }
    }
}

/// Retry a transport operation with exponential backoff capped at
/// `retry.max_delay_ms`, honoring cancellation. Shared by every adapter
/// so the backoff schedule stays uniform across wire formats.
async fn retry_with_backoff<F, Fut>(
    retry: &RetryConfig,
    retries: u32,
    cancel: Option<&CancellationToken>,
    operation: F,
) -> std::result::Result<reqwest::Response, String>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<reqwest::Response, reqwest::Error>>,
{
    let RetryConfig { base_delay_ms, max_delay_ms, .. } = *retry;
    let mut attempt = 0;
    let mut delay = Duration::from_millis(base_delay_ms);

    loop {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                return Err("transient".to_string());
            }
        }

        match operation().await {
            Ok(response) if response.status().is_success() || !response.status().is_server_error() => {
                return Ok(response);
            }
            Ok(response) if attempt >= retries => return Ok(response),
            Ok(_) => {}
            Err(_) if attempt >= retries => return Err("transient".to_string()),
            Err(_) => {}
        }

        attempt += 1;
        if let Some(token) = cancel {
            tokio::select! {
                _ = sleep(delay) => {}
                _ = token.cancelled() => return Err("transient".to_string()),
            }
        } else {
            sleep(delay).await;
        }

        let jitter_ms = rand::thread_rng().gen_range(-100..=100i64);
        let next_ms = ((delay.as_millis() as i64 * 2) + jitter_ms).max(0) as u64;
        delay = Duration::from_millis(next_ms.min(max_delay_ms));
    }
}

#[derive(Serialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct OpenAiChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Deserialize)]
struct GeminiResponsePart {
    text: String,
}

#[derive(Deserialize)]
struct GeminiResponseContent {
    parts: Vec<GeminiResponsePart>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiResponseContent,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

/// Convert [`ChatMessage`]s into `(system, user)` text, as used by callers
/// that build messages generically before handing them to [`LlmConnector::call`].
pub fn split_system_user(messages: &[ChatMessage]) -> (String, String) {
    let system = messages
        .iter()
        .filter(|m| m.role == MessageRole::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let user = messages
        .iter()
        .filter(|m| m.role == MessageRole::User)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    (system, user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_system_user_groups_by_role() {
        let messages = vec![ChatMessage::system("be terse"), ChatMessage::user("hello")];
        let (system, user) = split_system_user(&messages);
        assert_eq!(system, "be terse");
        assert_eq!(user, "hello");
    }

    #[tokio::test]
    async fn mock_mode_never_touches_the_network() {
        std::env::set_var("LLM_MOCK", "1");
        let connector = LlmConnector::new(LlmConfig::default()).unwrap();
        let result = connector
            .call("openai/gpt-4o", "sys", "hi", 0.2, 256, &[], None, None)
            .await
            .unwrap();
        assert_eq!(result.provider, "openai");
        assert!(!result.fallback_used);
        std::env::remove_var("LLM_MOCK");
    }

    #[tokio::test]
    async fn unresolvable_model_records_missing_credential_and_tries_fallback() {
        std::env::remove_var("LLM_MOCK");
        std::env::remove_var("OPENAI_API_KEY");
        let connector = LlmConnector::new(LlmConfig::default()).unwrap();
        let result = connector
            .call("openai/gpt-4o", "sys", "hi", 0.2, 256, &[], None, None)
            .await;
        match result {
            Err(OrchestratorError::AllProvidersFailed { candidates, .. }) => {
                assert_eq!(candidates[0].reason, "missing_credential");
            }
            _ => panic!("expected AllProvidersFailed"),
        }
    }
}
