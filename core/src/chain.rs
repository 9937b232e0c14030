//! Chain Runtime: orchestrates one full request — session resolution,
//! builder, critic fan-out, bounded refinement, closer, persistence.
//!
//! The critic fan-out uses `tokio::task::JoinSet` (a structured task
//! group: every spawned task is guaranteed to be awaited or aborted
//! before the set is dropped) and a `tokio_util::sync::CancellationToken`
//! for cooperative cancellation, both already teacher dependencies used
//! the same way in `llm::client::LlmClient`'s own request-cancellation
//! path.

use crate::compression::{self, TriggerClass};
use crate::config::{AgentConfig, OrchestratorConfig};
use crate::consensus::{self, CriticContribution};
use crate::context;
use crate::critic;
use crate::embedding;
use crate::error::{OrchestratorError, Result};
use crate::llm::{LlmConnector, Response as LlmResponse};
use crate::protocol::{NewConversation, RunResult, SessionSource};
use crate::refinement::{self, RefinementState};
use crate::session;
use crate::store::ConversationStore;
use crate::{info_log, warn_log};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Emit the one scrubbed, append-only JSON log line per LLM call the
/// runtime is required to produce (spec §4.11 observable side effects).
/// `write_to_debug_log` scrubs credential-shaped substrings before the
/// line ever reaches disk, same as every other `info_log!`/`warn_log!`
/// call site.
fn log_llm_call(agent: &str, session_id: Option<&str>, response: &LlmResponse) {
    let line = serde_json::json!({
        "event": "llm_call",
        "agent": agent,
        "session_id": session_id,
        "provider": response.provider,
        "requested_model": response.requested_model,
        "model_used": response.model_used,
        "prompt_tokens": response.prompt_tokens,
        "completion_tokens": response.completion_tokens,
        "duration_ms": response.duration_ms,
        "cost_usd": response.cost_usd,
        "fallback_used": response.fallback_used,
    })
    .to_string();
    info_log!("{line}");

    if response.fallback_used {
        warn_log!(
            "agent {agent} fell back from {} to {} ({})",
            response.requested_model,
            response.model_used,
            response.fallback_reason.as_deref().unwrap_or("unknown")
        );
    }
}

/// Shared runtime handle: one instance per process, holding the
/// singletons every chain call needs.
pub struct ChainRuntime {
    pub config: OrchestratorConfig,
    pub connector: Arc<LlmConnector>,
    pub store: ConversationStore,
}

impl ChainRuntime {
    pub fn new(config: OrchestratorConfig, connector: LlmConnector, store: ConversationStore) -> Self {
        Self { config, connector: Arc::new(connector), store }
    }

    /// `POST /ask` equivalent: run a single named agent once, with
    /// context injection but no critic/refinement/closer stages.
    pub async fn ask(&self, agent_name: &str, prompt: &str, session_id: Option<String>, override_model: Option<&str>) -> Result<RunResult> {
        let agent = self.require_agent(agent_name)?;
        let resolved_session = self.resolve_session(session_id)?;
        let result = self.run_agent_call(agent, prompt, resolved_session.as_deref(), override_model, None).await?;
        Ok(result)
    }

    /// `POST /chain` equivalent: the full builder → critics → refinement
    /// → closer pipeline.
    pub async fn chain(&self, prompt: &str, session_id: Option<String>, cancel: Option<&CancellationToken>) -> Result<Vec<RunResult>> {
        let resolved_session = self.resolve_session(session_id)?;
        let mut results = Vec::new();

        let builder_agent = self.require_agent("builder")?;
        let builder_result = self
            .run_agent_call(builder_agent, prompt, resolved_session.as_deref(), None, cancel)
            .await
            .map_err(|e| OrchestratorError::StageFailed { stage: "builder".to_string(), cause: e.to_string() })?;
        results.push(builder_result.clone());

        let builder_trigger_class = if builder_agent.memory_enabled { TriggerClass::MemoryEnabled } else { TriggerClass::Standard };
        let critic_input_prompt = compression::compress(
            &self.connector,
            &builder_result.response,
            builder_trigger_class,
            &self.config.compression,
        )
        .await;

        let (review, multi_critic, initial_selection) = self
            .run_critic_stage(prompt, &critic_input_prompt, resolved_session.as_deref(), cancel, None)
            .await?;
        results.push(multi_critic.clone());

        let final_review = self
            .run_refinement_loop(prompt, &builder_result, review, initial_selection, resolved_session.as_deref(), cancel, &mut results)
            .await?;

        let closer_result = self
            .run_closer_stage(prompt, &results, resolved_session.as_deref())
            .await
            .map_err(|e| OrchestratorError::StageFailed { stage: "closer".to_string(), cause: e.to_string() })?;
        results.push(closer_result);

        let _ = final_review;
        Ok(results)
    }

    fn require_agent(&self, name: &str) -> Result<&AgentConfig> {
        self.config
            .agent(name)
            .ok_or_else(|| OrchestratorError::ConfigError { message: format!("unknown agent: {name}") })
    }

    fn resolve_session(&self, session_id: Option<String>) -> Result<Option<String>> {
        match session_id {
            Some(id) => {
                session::validate_session_id(&id)?;
                self.store.save_session(&crate::protocol::SessionRecord {
                    session_id: id.clone(),
                    source: SessionSource::Api,
                    created_at: chrono::Utc::now().timestamp(),
                    last_active: chrono::Utc::now().timestamp(),
                    metadata: "{}".to_string(),
                })?;
                Ok(Some(id))
            }
            None => {
                let id = session::get_or_create_session(
                    &self.store,
                    SessionSource::Cli,
                    None,
                    self.config.cli_session_idle_hours,
                    self.config.session_cleanup_probability,
                    self.config.session_prune_after_days,
                )?;
                Ok(Some(id))
            }
        }
    }

    async fn run_agent_call(
        &self,
        agent: &AgentConfig,
        prompt: &str,
        session_id: Option<&str>,
        override_model: Option<&str>,
        cancel: Option<&CancellationToken>,
    ) -> Result<RunResult> {
        let (context_block, telemetry) = if agent.memory_enabled {
            context::aggregate(&self.store, &agent.name, prompt, session_id, &agent.memory).await
        } else {
            (String::new(), context::ContextTelemetry::default())
        };

        let system_prompt = if context_block.is_empty() {
            agent.system_prompt.clone()
        } else {
            format!("{}\n\n{}", agent.system_prompt, context_block)
        };

        let model = override_model.unwrap_or(&agent.model);
        let response = self
            .connector
            .call(model, &system_prompt, prompt, agent.temperature, agent.max_tokens, &agent.fallback_models, None, cancel)
            .await?;
        log_llm_call(&agent.name, session_id, &response);

        let embedding_blob = embedding::embed(prompt).await.map(|v| embedding::serialize(&v));

        let conversation_id = self.store.insert_conversation(NewConversation {
            agent: agent.name.clone(),
            model: response.model_used.clone(),
            provider: response.provider.clone(),
            prompt: prompt.to_string(),
            response: response.text.clone(),
            prompt_tokens: response.prompt_tokens,
            completion_tokens: response.completion_tokens,
            duration_ms: response.duration_ms as f64,
            estimated_cost_usd: response.cost_usd,
            fallback_used: response.fallback_used,
            session_id: session_id.map(str::to_string),
            embedding: embedding_blob,
        })?;
        let _ = conversation_id;

        if let Some(sid) = session_id {
            session::touch_session(
                &self.store,
                sid,
                self.config.session_cleanup_probability,
                self.config.session_prune_after_days,
            )?;
        }

        Ok(RunResult {
            agent: agent.name.clone(),
            model: response.model_used,
            provider: response.provider,
            response: response.text,
            prompt_tokens: response.prompt_tokens,
            completion_tokens: response.completion_tokens,
            total_tokens: response.total_tokens,
            duration_ms: response.duration_ms,
            estimated_cost_usd: response.cost_usd,
            fallback_used: response.fallback_used,
            fallback_reason: response.fallback_reason.clone(),
            injected_context_tokens: telemetry.total_tokens,
            session_context_tokens: telemetry.session_tokens,
            knowledge_context_tokens: telemetry.knowledge_tokens,
            session_id: session_id.map(str::to_string),
        })
    }

    /// Run the selected critics in parallel via a `JoinSet`, then merge
    /// via the Consensus Merger. Drops any critic whose call failed;
    /// fails the whole stage only if every critic failed.
    async fn run_critic_stage(
        &self,
        original_prompt: &str,
        compressed_builder_output: &str,
        session_id: Option<&str>,
        cancel: Option<&CancellationToken>,
        pinned_selection: Option<&[String]>,
    ) -> Result<(String, RunResult, Vec<String>)> {
        let selection = match pinned_selection {
            // Refinement pinned the initial iteration's critic selection
            // (spec §9 Open Question, default: re-select each iteration;
            // `reselect_critics_each_iteration = false` pins it instead).
            Some(names) => critic::pinned(names),
            None => critic::select(original_prompt, compressed_builder_output, &self.config.critics),
        };
        let selected_names: Vec<String> = selection.selected.iter().map(|s| s.name.clone()).collect();
        let critic_input = format!("{original_prompt}\n\n---\n\n{compressed_builder_output}");

        let mut join_set: JoinSet<Option<CriticContribution>> = JoinSet::new();
        for selected in &selection.selected {
            let Some(agent) = self.config.agent(&selected.name).cloned() else { continue };
            let weight = self
                .config
                .critics
                .critics
                .iter()
                .find(|c| c.name == selected.name)
                .map(|c| c.weight)
                .unwrap_or(1.0);
            let input = critic_input.clone();
            let session_id = session_id.map(str::to_string);
            let cancel = cancel.cloned();
            let connector = Arc::clone(&self.connector);
            let store = self.store.clone();

            // Spawned as a scoped task via JoinSet so every critic call
            // runs concurrently with its own retry/fallback and no
            // shared mutable state, per spec §5.
            join_set.spawn(run_single_critic(agent, weight, input, session_id, cancel, connector, store));
        }

        let mut contributions = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Some(contribution)) => contributions.push(contribution),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "critic task panicked"),
            }
        }

        // Collected results are reordered back into selection order for
        // deterministic consensus formatting (spec §5 ordering guarantee).
        contributions.sort_by_key(|c| selection.selected.iter().position(|s| s.name == c.name).unwrap_or(usize::MAX));

        let (review, multi_critic) = consensus::merge(&contributions, session_id).ok_or(OrchestratorError::AllCriticsFailed)?;
        Ok((review, multi_critic, selected_names))
    }

    async fn run_refinement_loop(
        &self,
        original_prompt: &str,
        initial_builder: &RunResult,
        initial_review: String,
        initial_selection: Vec<String>,
        session_id: Option<&str>,
        cancel: Option<&CancellationToken>,
        results: &mut Vec<RunResult>,
    ) -> Result<String> {
        if !self.config.refinement.enabled {
            return Ok(initial_review);
        }
        let pinned = if self.config.refinement.reselect_critics_each_iteration { None } else { Some(initial_selection) };

        let mut state = RefinementState::Initial;
        let mut issues = refinement::count_issues(&initial_review, &self.config.refinement);
        let mut previous_issues = None;
        let mut review = initial_review;
        let mut builder_output = initial_builder.response.clone();
        let mut iteration = 0usize;

        loop {
            state = refinement::next_state(&state, issues, previous_issues, &self.config.refinement);
            match &state {
                RefinementState::Converged { .. } => break,
                RefinementState::Iterate(n) => {
                    iteration = *n;
                    // The original builder/multi-critic pair is implicitly
                    // v1, so the first refined pair is v2 (spec §4.10,
                    // §8 ordering invariant).
                    let version = iteration + 1;
                    let critical_issues = refinement::extract_issues(&review, &self.config.refinement);
                    let refinement_prompt = format!(
                        "{original_prompt}\n\nThe previous attempt had the following issues to fix:\n{critical_issues}\n\nRevise the solution to address them."
                    );
                    let builder_agent = self.require_agent("builder")?;
                    let builder_result = self
                        .run_agent_call(builder_agent, &refinement_prompt, session_id, None, cancel)
                        .await
                        .map_err(|e| OrchestratorError::StageFailed { stage: format!("builder-v{version}"), cause: e.to_string() })?;
                    results.push(RunResult { agent: format!("builder-v{version}"), ..builder_result.clone() });
                    builder_output = builder_result.response.clone();

                    let trigger_class = if builder_agent.memory_enabled { TriggerClass::MemoryEnabled } else { TriggerClass::Standard };
                    let compressed = compression::compress(&self.connector, &builder_output, trigger_class, &self.config.compression).await;
                    let (new_review, multi_critic, _) = self
                        .run_critic_stage(original_prompt, &compressed, session_id, cancel, pinned.as_deref())
                        .await?;
                    results.push(RunResult { agent: format!("multi-critic-v{version}"), ..multi_critic });

                    previous_issues = Some(issues);
                    issues = refinement::count_issues(&new_review, &self.config.refinement);
                    review = new_review;
                }
                RefinementState::Initial => unreachable!("next_state never returns Initial"),
            }
        }

        let _ = builder_output;
        Ok(review)
    }

    async fn run_closer_stage(&self, original_prompt: &str, stage_results: &[RunResult], session_id: Option<&str>) -> Result<RunResult> {
        let closer_agent = self.require_agent("closer")?;

        // Every preserved stage output is compressed toward the closer's
        // (higher) threshold, since all of them are being folded into the
        // closer's own input (spec §4.7: "closer target >= 1500").
        let mut sections = Vec::new();
        for result in stage_results {
            let compressed = compression::compress(&self.connector, &result.response, TriggerClass::Closer, &self.config.compression).await;
            sections.push(format!("### {}\n{}", result.agent, compressed));
        }

        let closer_input = format!("{original_prompt}\n\n{}", sections.join("\n\n"));
        self.run_agent_call(closer_agent, &closer_input, session_id, None, None).await
    }
}

/// Free function so it can be spawned into a `JoinSet` without borrowing
/// `self` across an await point held by multiple concurrent tasks.
async fn run_single_critic(
    agent: AgentConfig,
    weight: f32,
    input: String,
    session_id: Option<String>,
    cancel: Option<CancellationToken>,
    connector: Arc<LlmConnector>,
    store: ConversationStore,
) -> Option<CriticContribution> {
    let (context_block, telemetry) = if agent.memory_enabled {
        context::aggregate(&store, &agent.name, &input, session_id.as_deref(), &agent.memory).await
    } else {
        (String::new(), context::ContextTelemetry::default())
    };

    let system_prompt = if context_block.is_empty() {
        agent.system_prompt.clone()
    } else {
        format!("{}\n\n{}", agent.system_prompt, context_block)
    };

    let response = connector
        .call(&agent.model, &system_prompt, &input, agent.temperature, agent.max_tokens, &agent.fallback_models, None, cancel.as_ref())
        .await
        .ok()?;
    log_llm_call(&agent.name, session_id.as_deref(), &response);

    let embedding_blob = embedding::embed(&input).await.map(|v| embedding::serialize(&v));
    let _ = store.insert_conversation(NewConversation {
        agent: agent.name.clone(),
        model: response.model_used.clone(),
        provider: response.provider.clone(),
        prompt: input,
        response: response.text.clone(),
        prompt_tokens: response.prompt_tokens,
        completion_tokens: response.completion_tokens,
        duration_ms: response.duration_ms as f64,
        estimated_cost_usd: response.cost_usd,
        fallback_used: response.fallback_used,
        session_id: session_id.clone(),
        embedding: embedding_blob,
    });

    Some(CriticContribution {
        name: agent.name.clone(),
        weight,
        result: RunResult {
            agent: agent.name,
            model: response.model_used,
            provider: response.provider,
            response: response.text,
            prompt_tokens: response.prompt_tokens,
            completion_tokens: response.completion_tokens,
            total_tokens: response.total_tokens,
            duration_ms: response.duration_ms,
            estimated_cost_usd: response.cost_usd,
            fallback_used: response.fallback_used,
            fallback_reason: response.fallback_reason.clone(),
            injected_context_tokens: telemetry.total_tokens,
            session_context_tokens: telemetry.session_tokens,
            knowledge_context_tokens: telemetry.knowledge_tokens,
            session_id,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmConfig;

    /// The mock adapter's canned text contains the literal substring
    /// "mock", so treating it as a critical keyword forces exactly one
    /// refinement round before `no_progress` converges (the issue count
    /// never changes between iterations).
    fn refining_config() -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.refinement.critical_keywords.clear();
        config.refinement.critical_keywords.insert("mock".to_string());
        config.refinement.issue_patterns.clear();
        config
    }

    #[tokio::test]
    async fn refined_stage_pair_is_labeled_v2_not_v1() {
        std::env::set_var("LLM_MOCK", "1");
        let connector = LlmConnector::new(LlmConfig::default()).unwrap();
        let store = ConversationStore::open_in_memory().unwrap();
        let runtime = ChainRuntime::new(refining_config(), connector, store);

        let results = runtime.chain("draft a landing page", None, None).await.unwrap();
        std::env::remove_var("LLM_MOCK");

        let agents: Vec<&str> = results.iter().map(|r| r.agent.as_str()).collect();
        assert_eq!(agents, vec!["builder", "multi-critic", "builder-v2", "multi-critic-v2", "closer"]);
    }
}
