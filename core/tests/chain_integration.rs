//! End-to-end integration tests for the Chain Runtime, driven against
//! `LLM_MOCK=1` so no network access is required. Grounded in the pack's
//! `tests/` directory convention (`slb350-open-agent-sdk-rust`,
//! `surrealdb-surrealdb`) since the teacher itself keeps everything in
//! colocated `#[cfg(test)]` modules and has no integration-test crate for
//! a full request to be exercised against.

use orchestrator_core::chain::ChainRuntime;
use orchestrator_core::config::OrchestratorConfig;
use orchestrator_core::llm::{LlmConfig, LlmConnector};
use orchestrator_core::store::ConversationStore;
use std::sync::Mutex;

fn runtime_with(config: OrchestratorConfig) -> ChainRuntime {
    let connector = LlmConnector::new(LlmConfig::default()).unwrap();
    let store = ConversationStore::open_in_memory().unwrap();
    ChainRuntime::new(config, connector, store)
}

// `LLM_MOCK` is process-global state; serialize tests that depend on it so
// they don't race with each other (or with `core/src/llm/client.rs`'s own
// mock-mode tests) inside the same test binary.
static MOCK_ENV: Mutex<()> = Mutex::new(());

fn runtime() -> ChainRuntime {
    let config = OrchestratorConfig::default();
    let connector = LlmConnector::new(LlmConfig::default()).unwrap();
    let store = ConversationStore::open_in_memory().unwrap();
    ChainRuntime::new(config, connector, store)
}

/// Spec §8: "For all chains, result list ordering is: exactly one builder
/// result, exactly one multi-critic result, zero or more (builder-vN,
/// multi-critic-vN) pairs in strictly increasing N, exactly one closer
/// result." The mock adapter's canned text never contains a critical
/// keyword, so refinement converges on `no_issues` without iterating.
#[tokio::test]
async fn chain_produces_builder_multicritic_closer_in_order_with_no_refinement() {
    let _guard = MOCK_ENV.lock().unwrap();
    std::env::set_var("LLM_MOCK", "1");

    let rt = runtime();
    let results = rt.chain("Render a static HTML landing page", None, None).await.unwrap();

    std::env::remove_var("LLM_MOCK");

    assert_eq!(results.len(), 3, "expected builder, multi-critic, closer with no refinement iterations");
    assert_eq!(results[0].agent, "builder");
    assert_eq!(results[1].agent, "multi-critic");
    assert_eq!(results[2].agent, "closer");
}

/// Every persisted call satisfies `total_tokens = prompt_tokens +
/// completion_tokens` and a non-negative cost (spec §8 universal
/// invariants).
#[tokio::test]
async fn every_stage_result_satisfies_token_and_cost_invariants() {
    let _guard = MOCK_ENV.lock().unwrap();
    std::env::set_var("LLM_MOCK", "1");

    let rt = runtime();
    let results = rt.chain("Explain how binary search works", None, None).await.unwrap();

    std::env::remove_var("LLM_MOCK");

    for result in &results {
        assert_eq!(result.total_tokens, result.prompt_tokens + result.completion_tokens);
        assert!(result.estimated_cost_usd >= 0.0);
    }
}

/// `ask` resolves a session id when none is supplied, and reuses the same
/// CLI session across calls from the same process (spec §4.5 reuse rule).
#[tokio::test]
async fn ask_without_session_id_reuses_cli_session_across_calls() {
    let _guard = MOCK_ENV.lock().unwrap();
    std::env::set_var("LLM_MOCK", "1");

    let rt = runtime();
    let first = rt.ask("builder", "Build a FastAPI JWT auth endpoint", None, None).await.unwrap();
    let second = rt.ask("builder", "Now add refresh tokens", None, None).await.unwrap();

    std::env::remove_var("LLM_MOCK");

    assert!(first.session_id.is_some());
    assert_eq!(first.session_id, second.session_id);
    // The second call's session slice should now see the first turn.
    assert!(second.session_context_tokens > 0);
}

/// Spec §4.10/§8: the builder/multi-critic pair that already ran before
/// the loop starts is implicitly v1, so the first refined pair must be
/// `builder-v2`/`multi-critic-v2`, matching acceptance scenario 4's
/// expected ordering `[builder, multi-critic, builder-v2, multi-critic-v2,
/// closer]`. The mock adapter's canned text contains the literal
/// substring "mock", so registering it as a critical keyword forces
/// exactly one refinement round (the issue count never changes between
/// iterations, so the loop converges on `no_progress`).
#[tokio::test]
async fn refinement_round_uses_v2_naming_not_v1() {
    let _guard = MOCK_ENV.lock().unwrap();
    std::env::set_var("LLM_MOCK", "1");

    let mut config = OrchestratorConfig::default();
    config.refinement.critical_keywords.clear();
    config.refinement.critical_keywords.insert("mock".to_string());
    config.refinement.issue_patterns.clear();
    let rt = runtime_with(config);

    let results = rt.chain("draft a landing page", None, None).await.unwrap();

    std::env::remove_var("LLM_MOCK");

    let agents: Vec<&str> = results.iter().map(|r| r.agent.as_str()).collect();
    assert_eq!(agents, vec!["builder", "multi-critic", "builder-v2", "multi-critic-v2", "closer"]);
}

/// An unknown agent name surfaces `ConfigError` rather than panicking or
/// silently falling back (spec §9: unresolvable agent/model references
/// never recover silently).
#[tokio::test]
async fn ask_with_unknown_agent_is_a_config_error() {
    let rt = runtime();
    let err = rt.ask("no-such-agent", "hello", None, None).await.unwrap_err();
    assert_eq!(err.cli_exit_code(), 3);
}
