//! Resolved configuration schema.
//!
//! YAML/env loading mechanics are an out-of-scope external collaborator;
//! only the resolved, validated schema lives here, following the teacher's
//! `config/agent.rs` shape (serde structs, `Default`, `merge`, `from_file`).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Memory retrieval strategy for an agent's context injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStrategy {
    Semantic,
    Hybrid,
    Keywords,
}

impl Default for MemoryStrategy {
    fn default() -> Self {
        MemoryStrategy::Hybrid
    }
}

/// Per-agent memory retrieval configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub strategy: MemoryStrategy,
    pub session_limit: usize,
    pub min_relevance: f32,
    pub time_decay_hours: f32,
    pub max_context_tokens: usize,
    /// Whether knowledge-slice lookups exclude same-agent candidates in
    /// addition to the current session (Open Question in spec §9,
    /// decided in DESIGN.md — default false: only the current session is
    /// excluded).
    pub exclude_same_agent: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            strategy: MemoryStrategy::default(),
            session_limit: 10,
            min_relevance: 0.3,
            time_decay_hours: 72.0,
            max_context_tokens: 2000,
            exclude_same_agent: false,
        }
    }
}

/// One named agent role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub model: String,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub fallback_models: Vec<String>,
    pub memory_enabled: bool,
    pub memory: MemoryConfig,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("agent name cannot be empty".into());
        }
        if !self.model.contains('/') {
            return Err(format!("model '{}' must be of the form provider/model", self.model));
        }
        if self.temperature < 0.0 {
            return Err("temperature must be >= 0".into());
        }
        if self.max_tokens == 0 {
            return Err("max_tokens must be > 0".into());
        }
        Ok(())
    }
}

/// Registration for a single critic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticRegistration {
    pub name: String,
    pub weight: f32,
    pub keywords: HashSet<String>,
}

/// Global critic-selection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticConfig {
    pub critics: Vec<CriticRegistration>,
    pub min_critics: usize,
    pub max_critics: usize,
    pub fallback_critics: Vec<String>,
    pub dynamic_selection_enabled: bool,
}

impl CriticConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_critics == 0 {
            return Err("min_critics must be >= 1".into());
        }
        if self.min_critics > self.max_critics {
            return Err("min_critics must be <= max_critics".into());
        }
        if self.max_critics > self.critics.len() {
            return Err("max_critics cannot exceed the number of registered critics".into());
        }
        Ok(())
    }
}

/// Refinement loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementConfig {
    pub enabled: bool,
    pub max_iterations: usize,
    pub critical_keywords: HashSet<String>,
    #[serde(default)]
    pub issue_patterns: Vec<String>,
    /// Whether refinement iterations re-run critic selection, or pin the
    /// initial selection (Open Question in spec §9; default re-select,
    /// see DESIGN.md).
    pub reselect_critics_each_iteration: bool,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        let mut critical_keywords = HashSet::new();
        critical_keywords.insert("security".to_string());
        critical_keywords.insert("vulnerability".to_string());
        critical_keywords.insert("critical".to_string());
        Self {
            enabled: true,
            max_iterations: 3,
            critical_keywords,
            issue_patterns: vec![r"(?i)\bSECURITY\b".to_string()],
            reselect_critics_each_iteration: true,
        }
    }
}

/// Per-agent-class compression trigger thresholds, in characters of the
/// prior stage's raw output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub model: String,
    pub target_tokens: usize,
    pub standard_threshold_chars: usize,
    pub memory_enabled_threshold_chars: usize,
    pub closer_threshold_chars: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            model: "openai/gpt-4o-mini".to_string(),
            target_tokens: 500,
            standard_threshold_chars: 1200,
            memory_enabled_threshold_chars: 800,
            closer_threshold_chars: 1500,
        }
    }
}

/// Retry/backoff configuration for the LLM connector (spec §9 Open
/// Question: exact schedule and retry count are exposed as configuration).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 4000,
        }
    }
}

/// Process-wide, immutable-after-startup configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub agents: Vec<AgentConfig>,
    pub critics: CriticConfig,
    pub refinement: RefinementConfig,
    pub compression: CompressionConfig,
    pub retry: RetryConfig,
    /// Idle window (hours) before a CLI session is considered stale and a
    /// new one is minted instead of reused.
    pub cli_session_idle_hours: f32,
    /// Probability of running `prune_inactive_sessions` on every
    /// `save_session` call.
    pub session_cleanup_probability: f64,
    /// Age (days) after which an inactive session and its conversations
    /// are eligible for pruning.
    pub session_prune_after_days: f32,
}

impl Default for OrchestratorConfig {
    /// A minimal but internally-consistent bootstrap configuration: a
    /// builder, three critics (security/performance/quality), and a
    /// closer. Used when no config file is present (`load_or_default`),
    /// so the CLI and tests have a runnable chain out of the box.
    fn default() -> Self {
        fn keywords(words: &[&str]) -> HashSet<String> {
            words.iter().map(|w| w.to_string()).collect()
        }

        Self {
            agents: vec![
                AgentConfig {
                    name: "builder".to_string(),
                    model: "openai/gpt-4o".to_string(),
                    system_prompt: "You are a builder agent. Produce a complete, working solution to the user's request.".to_string(),
                    temperature: 0.3,
                    max_tokens: 4096,
                    fallback_models: vec!["anthropic/claude-sonnet".to_string()],
                    memory_enabled: true,
                    memory: MemoryConfig::default(),
                },
                AgentConfig {
                    name: "security".to_string(),
                    model: "openai/gpt-4o-mini".to_string(),
                    system_prompt: "You are a security critic. Flag vulnerabilities, unsafe auth, and injection risks.".to_string(),
                    temperature: 0.2,
                    max_tokens: 1024,
                    fallback_models: vec!["anthropic/claude-haiku".to_string()],
                    memory_enabled: false,
                    memory: MemoryConfig::default(),
                },
                AgentConfig {
                    name: "performance".to_string(),
                    model: "openai/gpt-4o-mini".to_string(),
                    system_prompt: "You are a performance critic. Flag slow queries, n+1s, and unnecessary allocation.".to_string(),
                    temperature: 0.2,
                    max_tokens: 1024,
                    fallback_models: vec!["anthropic/claude-haiku".to_string()],
                    memory_enabled: false,
                    memory: MemoryConfig::default(),
                },
                AgentConfig {
                    name: "quality".to_string(),
                    model: "openai/gpt-4o-mini".to_string(),
                    system_prompt: "You are a code-quality critic. Flag naming, structure, and missing tests.".to_string(),
                    temperature: 0.2,
                    max_tokens: 1024,
                    fallback_models: vec!["anthropic/claude-haiku".to_string()],
                    memory_enabled: false,
                    memory: MemoryConfig::default(),
                },
                AgentConfig {
                    name: "closer".to_string(),
                    model: "openai/gpt-4o".to_string(),
                    system_prompt: "You are the closer. Synthesize the builder's work and the critics' feedback into a final answer.".to_string(),
                    temperature: 0.3,
                    max_tokens: 4096,
                    fallback_models: vec!["anthropic/claude-sonnet".to_string()],
                    memory_enabled: false,
                    memory: MemoryConfig::default(),
                },
            ],
            critics: CriticConfig {
                critics: vec![
                    CriticRegistration {
                        name: "security".to_string(),
                        weight: 2.0,
                        keywords: keywords(&["jwt", "auth", "password", "token", "security", "vulnerability", "injection"]),
                    },
                    CriticRegistration {
                        name: "performance".to_string(),
                        weight: 1.0,
                        keywords: keywords(&["cache", "query", "slow", "latency", "performance", "n+1"]),
                    },
                    CriticRegistration {
                        name: "quality".to_string(),
                        weight: 1.0,
                        keywords: keywords(&["refactor", "design pattern", "naming", "readability", "test"]),
                    },
                ],
                min_critics: 1,
                max_critics: 2,
                fallback_critics: vec!["quality".to_string()],
                dynamic_selection_enabled: true,
            },
            refinement: RefinementConfig::default(),
            compression: CompressionConfig::default(),
            retry: RetryConfig::default(),
            cli_session_idle_hours: 2.0,
            session_cleanup_probability: 0.1,
            session_prune_after_days: 7.0,
        }
    }
}

impl OrchestratorConfig {
    /// Load from a TOML file, falling back to `Default` on any error.
    pub fn load_or_default(path: impl AsRef<std::path::Path>) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    /// Find an agent config by name.
    pub fn agent(&self, name: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.name == name)
    }

    /// Validate the whole resolved configuration. Unknown agent or model
    /// references surface as `ConfigError` at startup, never recovered
    /// silently, per spec §9.
    pub fn validate(&self) -> Result<(), String> {
        for agent in &self.agents {
            agent.validate()?;
        }
        self.critics.validate()?;
        for name in &self.critics.fallback_critics {
            if self.agent(name).is_none() {
                return Err(format!("fallback critic '{}' is not a registered agent", name));
            }
        }
        for critic in &self.critics.critics {
            if self.agent(&critic.name).is_none() {
                return Err(format!("critic '{}' is not a registered agent", critic.name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_agent(name: &str) -> AgentConfig {
        AgentConfig {
            name: name.to_string(),
            model: "openai/gpt-4o".to_string(),
            system_prompt: "You are an agent.".to_string(),
            temperature: 0.3,
            max_tokens: 2048,
            fallback_models: vec!["anthropic/claude-haiku".to_string()],
            memory_enabled: false,
            memory: MemoryConfig::default(),
        }
    }

    #[test]
    fn default_config_is_internally_consistent() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn agent_requires_provider_prefixed_model() {
        let mut agent = sample_agent("builder");
        agent.model = "gpt-4o".to_string();
        assert!(agent.validate().is_err());
    }

    #[test]
    fn critic_config_rejects_min_greater_than_max() {
        let config = CriticConfig {
            critics: vec![],
            min_critics: 2,
            max_critics: 1,
            fallback_critics: vec![],
            dynamic_selection_enabled: true,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_critic_agent() {
        let mut config = OrchestratorConfig::default();
        config.agents.push(sample_agent("builder"));
        config.critics.critics.push(CriticRegistration {
            name: "security".to_string(),
            weight: 1.0,
            keywords: HashSet::new(),
        });
        config.critics.max_critics = 1;
        assert!(config.validate().is_err());
    }
}
