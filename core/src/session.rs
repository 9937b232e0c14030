//! Session Manager: id validation/generation, CLI session reuse, and
//! probabilistic pruning.

use crate::error::{OrchestratorError, Result};
use crate::protocol::{SessionRecord, SessionSource};
use crate::store::ConversationStore;
use rand::Rng;
use regex::Regex;
use std::sync::OnceLock;

fn session_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap())
}

/// Validate a caller-supplied session id against the persisted-id syntax.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id_pattern().is_match(session_id) {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidSessionId { session_id: session_id.to_string() })
    }
}

fn random_alnum(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..len).map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char).collect()
}

/// Generate a new CLI session id: `cli-{pid}-{UTC timestamp compact}`.
pub fn generate_cli_id(pid: u32) -> String {
    let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3f");
    format!("cli-{pid}-{timestamp}")
}

/// Generate a new API session id when the caller supplied none:
/// `api-{unix_ms}-{8 random alnum}`.
pub fn generate_api_id() -> String {
    let unix_ms = chrono::Utc::now().timestamp_millis();
    format!("api-{unix_ms}-{}", random_alnum(8))
}

/// Generate a UI session id: `ui-{unix_ms}-{8 random alnum}`. The UI
/// frontend typically assigns its own id and the backend only validates
/// it; this exists for completeness and for tests exercising the UI path.
pub fn generate_ui_id() -> String {
    let unix_ms = chrono::Utc::now().timestamp_millis();
    format!("ui-{unix_ms}-{}", random_alnum(8))
}

/// Resolve or mint a session id for the given `(source, pid-for-cli)`,
/// persisting the session record. Runs probabilistic cleanup afterward.
///
/// `idle_hours`/`cleanup_probability`/`prune_after_days` come from
/// [`crate::config::OrchestratorConfig`] (`cli_session_idle_hours`,
/// `session_cleanup_probability`, `session_prune_after_days`) rather than
/// being hardcoded here, so a deployment can retune reuse/pruning behavior
/// without a code change.
pub fn get_or_create_session(
    store: &ConversationStore,
    source: SessionSource,
    pid: Option<u32>,
    idle_hours: f32,
    cleanup_probability: f64,
    prune_after_days: f32,
) -> Result<String> {
    let now = chrono::Utc::now().timestamp();
    let idle_window = chrono::Duration::milliseconds((idle_hours as f64 * 3_600_000.0) as i64);

    let session_id = match source {
        SessionSource::Cli => {
            let pid = pid.unwrap_or_else(std::process::id);
            match store.find_active_cli_session(pid, idle_window)? {
                Some(existing) => existing.session_id,
                None => {
                    let new_id = generate_cli_id(pid);
                    store.save_session(&SessionRecord {
                        session_id: new_id.clone(),
                        source: SessionSource::Cli,
                        created_at: now,
                        last_active: now,
                        metadata: format!("{{\"pid\":{pid}}}"),
                    })?;
                    new_id
                }
            }
        }
        SessionSource::Ui => {
            let new_id = generate_ui_id();
            store.save_session(&SessionRecord {
                session_id: new_id.clone(),
                source: SessionSource::Ui,
                created_at: now,
                last_active: now,
                metadata: "{}".to_string(),
            })?;
            new_id
        }
        SessionSource::Api => {
            let new_id = generate_api_id();
            store.save_session(&SessionRecord {
                session_id: new_id.clone(),
                source: SessionSource::Api,
                created_at: now,
                last_active: now,
                metadata: "{}".to_string(),
            })?;
            new_id
        }
    };

    maybe_prune(store, cleanup_probability, prune_after_days)?;
    Ok(session_id)
}

/// Record activity on an existing session: bumps `last_active` to now.
/// This is the point at which a reused CLI session's `last_active`
/// actually updates (spec §4.5: "do not reset `last_active` until a
/// conversation lands").
pub fn touch_session(store: &ConversationStore, session_id: &str, cleanup_probability: f64, prune_after_days: f32) -> Result<()> {
    if let Some(mut rec) = store.get_session(session_id)? {
        rec.last_active = chrono::Utc::now().timestamp();
        store.save_session(&rec)?;
    }
    maybe_prune(store, cleanup_probability, prune_after_days)?;
    Ok(())
}

fn maybe_prune(store: &ConversationStore, cleanup_probability: f64, prune_after_days: f32) -> Result<()> {
    if rand::thread_rng().gen_bool(cleanup_probability.clamp(0.0, 1.0)) {
        let cutoff = chrono::Utc::now().timestamp() - (prune_after_days as i64) * 24 * 60 * 60;
        store.prune_inactive_sessions(cutoff)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_overlong_and_invalid_chars() {
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id(&"a".repeat(65)).is_err());
        assert!(validate_session_id("has space").is_err());
        assert!(validate_session_id("has/slash").is_err());
    }

    #[test]
    fn accepts_reserved_prefixes_and_arbitrary_valid_ids() {
        assert!(validate_session_id("cli-1234-20260101T000000000").is_ok());
        assert!(validate_session_id("my_custom-id123").is_ok());
    }

    #[test]
    fn cli_id_reuse_within_idle_window() {
        let store = ConversationStore::open_in_memory().unwrap();
        let first = get_or_create_session(&store, SessionSource::Cli, Some(777), 2.0, 0.0, 7.0).unwrap();
        let second = get_or_create_session(&store, SessionSource::Cli, Some(777), 2.0, 0.0, 7.0).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn different_pid_gets_a_new_session() {
        let store = ConversationStore::open_in_memory().unwrap();
        let first = get_or_create_session(&store, SessionSource::Cli, Some(1), 2.0, 0.0, 7.0).unwrap();
        let second = get_or_create_session(&store, SessionSource::Cli, Some(2), 2.0, 0.0, 7.0).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn idle_window_respects_configured_hours() {
        let store = ConversationStore::open_in_memory().unwrap();
        let now = chrono::Utc::now().timestamp();
        store
            .save_session(&SessionRecord {
                session_id: "cli-555-old".to_string(),
                source: SessionSource::Cli,
                created_at: now - 3600,
                last_active: now - 3600,
                metadata: "{\"pid\":555}".to_string(),
            })
            .unwrap();
        // A 0.5h idle window should treat a session inactive for 1h as stale.
        let fresh = get_or_create_session(&store, SessionSource::Cli, Some(555), 0.5, 0.0, 7.0).unwrap();
        assert_ne!(fresh, "cli-555-old");
    }

    #[test]
    fn api_ids_are_unique() {
        let a = generate_api_id();
        let b = generate_api_id();
        assert_ne!(a, b);
        assert!(a.starts_with("api-"));
    }
}
