//! Provider Registry: resolves `"provider/model"` identifiers to a
//! provider id and reports which providers are usable given configuration,
//! credentials, and the `DISABLE_<PROVIDER>` kill switch.
//!
//! Grounded in the teacher's `llm::client::LlmProvider` enum and its
//! `FromStr` alias table (`core/src/llm/client.rs`), generalized from the
//! teacher's three hardcoded backends to the spec's open-ended provider id.

use std::collections::HashMap;
use std::env;

/// A resolved provider identity: the canonical id plus the env var holding
/// its credential and its default API base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub id: String,
    pub credential_env: String,
    pub default_base_url: String,
}

/// Split `"provider/model"` into its two halves.
///
/// Models without a `/` are treated as a configuration error by the
/// caller (spec §9: unresolved model references never fail silently).
pub fn split_model_ref(model_ref: &str) -> Option<(&str, &str)> {
    model_ref.split_once('/')
}

fn known_providers() -> &'static HashMap<&'static str, ProviderInfo> {
    use std::sync::OnceLock;
    static TABLE: OnceLock<HashMap<&'static str, ProviderInfo>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = HashMap::new();
        table.insert(
            "openai",
            ProviderInfo {
                id: "openai".to_string(),
                credential_env: "OPENAI_API_KEY".to_string(),
                default_base_url: "https://api.openai.com/v1".to_string(),
            },
        );
        table.insert(
            "anthropic",
            ProviderInfo {
                id: "anthropic".to_string(),
                credential_env: "ANTHROPIC_API_KEY".to_string(),
                default_base_url: "https://api.anthropic.com/v1".to_string(),
            },
        );
        table.insert(
            "gemini",
            ProviderInfo {
                id: "gemini".to_string(),
                credential_env: "GEMINI_API_KEY".to_string(),
                default_base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            },
        );
        table.insert(
            "openrouter",
            ProviderInfo {
                id: "openrouter".to_string(),
                credential_env: "OPENROUTER_API_KEY".to_string(),
                default_base_url: "https://openrouter.ai/api/v1".to_string(),
            },
        );
        table
    })
}

/// Resolve a provider id to its [`ProviderInfo`], if known.
pub fn resolve(provider_id: &str) -> Option<&'static ProviderInfo> {
    known_providers().get(provider_id)
}

/// `DISABLE_<PROVIDER>=1` env var name for a given provider id.
fn disable_env_var(provider_id: &str) -> String {
    format!("DISABLE_{}", provider_id.to_uppercase())
}

/// Whether `provider_id` has been force-disabled via its kill switch,
/// independent of whether credentials are present.
pub fn is_disabled(provider_id: &str) -> bool {
    env::var(disable_env_var(provider_id))
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Whether a credential is present for `provider_id` (mock mode always
/// reports true, since [`crate::llm`] substitutes canned responses and
/// never reaches the network).
pub fn has_credential(provider_id: &str) -> bool {
    if is_mock_mode() {
        return true;
    }
    match resolve(provider_id) {
        Some(info) => env::var(&info.credential_env)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false),
        None => false,
    }
}

/// Whether `LLM_MOCK=1` is set, switching the LLM Connector to
/// deterministic canned responses for tests.
pub fn is_mock_mode() -> bool {
    env::var("LLM_MOCK").map(|v| v == "1").unwrap_or(false)
}

/// Whether `provider_id` is usable right now: known, not disabled, and
/// credentialed.
pub fn is_enabled(provider_id: &str) -> bool {
    resolve(provider_id).is_some() && !is_disabled(provider_id) && has_credential(provider_id)
}

/// Enumerate every known provider id paired with its enabled status, for
/// the `/system` or `endpoints` diagnostic surface.
pub fn enabled_providers() -> Vec<(String, bool)> {
    let mut providers: Vec<(String, bool)> = known_providers()
        .keys()
        .map(|id| (id.to_string(), is_enabled(id)))
        .collect();
    providers.sort_by(|a, b| a.0.cmp(&b.0));
    providers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests mutate process env vars; serialize them to avoid cross-test
    // interference since env is process-global state.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn splits_provider_and_model() {
        assert_eq!(split_model_ref("openai/gpt-4o"), Some(("openai", "gpt-4o")));
        assert_eq!(split_model_ref("no-slash-here"), None);
    }

    #[test]
    fn unknown_provider_is_not_enabled() {
        let _guard = ENV_LOCK.lock().unwrap();
        assert!(!is_enabled("not-a-real-provider"));
    }

    #[test]
    fn disable_env_var_wins_over_credential() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("OPENAI_API_KEY", "sk-test12345678");
        env::set_var("DISABLE_OPENAI", "1");
        assert!(!is_enabled("openai"));
        env::remove_var("DISABLE_OPENAI");
        env::remove_var("OPENAI_API_KEY");
    }

    #[test]
    fn mock_mode_reports_credentials_present() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("OPENAI_API_KEY");
        env::set_var("LLM_MOCK", "1");
        assert!(has_credential("openai"));
        env::remove_var("LLM_MOCK");
    }

    #[test]
    fn enabled_providers_is_sorted_by_id() {
        let providers = enabled_providers();
        let mut sorted = providers.clone();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(providers, sorted);
    }
}
