//! Core library for the orchestration engine
//!
//! A user prompt is dispatched through a chain of role-specialized LLM
//! agents (builder, critics, closer). This crate holds the orchestration
//! runtime: chain state machine, critic selection and consensus, bounded
//! refinement, semantic compression, provider-fallback LLM connector,
//! dual-context conversation memory, and session lifecycle.

#![deny(unsafe_code)]

use std::sync::Mutex;

/// Global log file handle for the append-only debug log.
static DEBUG_LOG: Mutex<Option<std::fs::File>> = Mutex::new(None);

/// Initialize debug log file logging.
pub fn init_debug_log(path: Option<std::path::PathBuf>) -> std::io::Result<()> {
    let log_path = path.unwrap_or_else(|| std::path::PathBuf::from("debug.log"));
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    *DEBUG_LOG.lock().unwrap() = Some(file);
    Ok(())
}

/// Write to the debug log if initialized.
pub fn write_to_debug_log(level: &str, message: &str) {
    use std::io::Write;
    let scrubbed = crate::util::scrub_credentials(message);
    if let Ok(mut guard) = DEBUG_LOG.lock() {
        if let Some(ref mut file) = *guard {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let _ = writeln!(file, "[{}] [{}] {}", timestamp, level, scrubbed);
            let _ = file.flush();
        }
    }
}

#[macro_export]
macro_rules! info_log {
    ($($arg:tt)*) => {
        $crate::write_to_debug_log("INFO", &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! error_log {
    ($($arg:tt)*) => {
        $crate::write_to_debug_log("ERROR", &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn_log {
    ($($arg:tt)*) => {
        $crate::write_to_debug_log("WARN", &format!($($arg)*))
    };
}

pub mod chain;
pub mod compression;
pub mod config;
pub mod consensus;
pub mod context;
pub mod critic;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod protocol;
pub mod provider;
pub mod refinement;
pub mod session;
pub mod store;
pub mod tokenizer;
pub mod util;

pub use error::{OrchestratorError, Result};
