//! `orchestrator` - CLI front end for the multi-agent orchestration engine.
//!
//! A thin `clap`-derived surface over `orchestrator_core::chain::ChainRuntime`:
//! single-agent calls, full builder/critic/refinement/closer chains, and
//! conversation-memory inspection. Mirrors the external interface's CLI
//! exit-code contract (0 success, 2 invalid args, 3 config error, 4 all
//! providers failed, 5 store error).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orchestrator_core::chain::ChainRuntime;
use orchestrator_core::config::OrchestratorConfig;
use orchestrator_core::llm::{LlmConfig, LlmConnector};
use orchestrator_core::protocol::RunResult;
use orchestrator_core::store::ConversationStore;
use orchestrator_core::{error_log, info_log, OrchestratorError};
use std::path::PathBuf;

const CONFIG_DIR_NAME: &str = "orchestrator";
const CONFIG_FILE_NAME: &str = "config.toml";
const DB_FILE_NAME: &str = "conversations.db";

#[derive(Parser)]
#[command(name = "orchestrator", version, about = "Multi-agent LLM orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single named agent once, with context injection but no
    /// critic/refinement/closer stages.
    Ask {
        agent: String,
        prompt: Vec<String>,
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Run the full builder -> critics -> refinement -> closer chain.
    Chain {
        prompt: Vec<String>,
        #[arg(long)]
        session: Option<String>,
    },
    /// Show the most recent conversations, newest first.
    Logs {
        #[arg(default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Show the single most recent conversation.
    Last,
    /// Show every stage result from the most recent chain run.
    LastChain,
    #[command(subcommand)]
    Memory(MemoryCommands),
}

#[derive(Subcommand)]
enum MemoryCommands {
    /// Substring search over prompt/response text.
    Search {
        query: String,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Most recent conversations, optionally scoped to an agent.
    Recent {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Aggregate conversation counts and storage stats.
    Stats,
    /// Delete a single conversation by id.
    Delete { id: i64 },
    /// Prune sessions inactive for more than the configured window.
    Cleanup,
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err}");
            error_log!("{err:?}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<OrchestratorError>() {
        Some(orch_err) => orch_err.cli_exit_code(),
        None => 2,
    }
}

async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join(CONFIG_DIR_NAME);
    std::fs::create_dir_all(&data_dir).context("failed to create data directory")?;
    orchestrator_core::init_debug_log(Some(data_dir.join("debug.log"))).ok();
    info_log!("orchestrator starting up");

    let config_path = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME);
    let config = OrchestratorConfig::load_or_default(&config_path);
    config
        .validate()
        .map_err(|message| OrchestratorError::ConfigError { message })?;

    let connector = LlmConnector::new(LlmConfig::default()).map_err(|e| anyhow::anyhow!(e))?;
    let store = ConversationStore::open(&data_dir.join(DB_FILE_NAME)).map_err(|e| anyhow::anyhow!(e))?;
    let prune_after_days = config.session_prune_after_days;
    let runtime = ChainRuntime::new(config, connector, store.clone());

    let cli = Cli::parse();
    match cli.command {
        Commands::Ask { agent, prompt, session, model } => {
            let prompt = join_prompt(prompt)?;
            let result = runtime.ask(&agent, &prompt, session, model.as_deref()).await.map_err(|e| anyhow::anyhow!(e))?;
            print_run_result(&result);
        }
        Commands::Chain { prompt, session } => {
            let prompt = join_prompt(prompt)?;
            let results = runtime.chain(&prompt, session, None).await.map_err(|e| anyhow::anyhow!(e))?;
            for result in &results {
                print_run_result(result);
                println!();
            }
        }
        Commands::Logs { limit, agent } => {
            let records = store.recent(limit, agent.as_deref()).map_err(|e| anyhow::anyhow!(e))?;
            for record in &records {
                println!(
                    "[{}] #{} {} ({}/{}) {} tok, ${:.4}",
                    record.timestamp, record.id, record.agent, record.provider, record.model, record.total_tokens, record.estimated_cost_usd
                );
            }
        }
        Commands::Last => {
            let record = store
                .recent(1, None)
                .map_err(|e| anyhow::anyhow!(e))?
                .into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!(OrchestratorError::NotFound("no conversations recorded yet".to_string())))?;
            println!("agent:    {}", record.agent);
            println!("model:    {} ({})", record.model, record.provider);
            println!("prompt:   {}", record.prompt);
            println!("response: {}", record.response);
        }
        Commands::LastChain => {
            let latest = store
                .recent(1, None)
                .map_err(|e| anyhow::anyhow!(e))?
                .into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!(OrchestratorError::NotFound("no conversations recorded yet".to_string())))?;
            match latest.session_id {
                Some(session_id) => {
                    let records = store.get_recent_by_session(&session_id, 100).map_err(|e| anyhow::anyhow!(e))?;
                    for record in &records {
                        println!("### {} ({}/{})\n{}\n", record.agent, record.provider, record.model, record.response);
                    }
                }
                None => println!("### {} ({}/{})\n{}\n", latest.agent, latest.provider, latest.model, latest.response),
            }
        }
        Commands::Memory(memory_command) => handle_memory_command(&store, memory_command, prune_after_days)?,
    }

    Ok(())
}

fn handle_memory_command(store: &ConversationStore, command: MemoryCommands, prune_after_days: f32) -> Result<()> {
    match command {
        MemoryCommands::Search { query, agent, limit } => {
            let records = store.search(&query, agent.as_deref(), limit).map_err(|e| anyhow::anyhow!(e))?;
            for record in &records {
                println!("#{} [{}] {}: {}", record.id, record.agent, record.prompt, record.response);
            }
        }
        MemoryCommands::Recent { limit, agent } => {
            let records = store.recent(limit, agent.as_deref()).map_err(|e| anyhow::anyhow!(e))?;
            for record in &records {
                println!("#{} [{}] {}", record.id, record.agent, record.prompt);
            }
        }
        MemoryCommands::Stats => {
            let count = store.count_conversations().map_err(|e| anyhow::anyhow!(e))?;
            println!("conversations: {count}");
        }
        MemoryCommands::Delete { id } => {
            store.delete(id).map_err(|e| anyhow::anyhow!(e))?;
            println!("deleted #{id}");
        }
        MemoryCommands::Cleanup => {
            let cutoff = chrono::Utc::now().timestamp() - (prune_after_days as i64) * 24 * 60 * 60;
            let pruned_sessions = store.prune_inactive_sessions(cutoff).map_err(|e| anyhow::anyhow!(e))?;
            let orphaned = store.cleanup().map_err(|e| anyhow::anyhow!(e))?;
            println!("pruned {pruned_sessions} inactive sessions, removed {orphaned} orphaned conversations");
        }
    }
    Ok(())
}

fn join_prompt(words: Vec<String>) -> Result<String> {
    if words.is_empty() {
        return Err(anyhow::anyhow!(OrchestratorError::InvalidInput { message: "prompt must not be empty".to_string() }));
    }
    Ok(words.join(" "))
}

fn print_run_result(result: &RunResult) {
    println!("agent:    {}", result.agent);
    println!("model:    {} ({})", result.model, result.provider);
    if result.fallback_used {
        println!("fallback: yes ({})", result.fallback_reason.as_deref().unwrap_or("unknown"));
    }
    println!(
        "tokens:   {} prompt + {} completion = {} total (+{} context)",
        result.prompt_tokens, result.completion_tokens, result.total_tokens, result.injected_context_tokens
    );
    println!("cost:     ${:.4}", result.estimated_cost_usd);
    println!("response: {}", result.response);
}
