//! Shared utility functions: header/URL sanitization and credential scrubbing.

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::sync::OnceLock;

/// Sanitize a string value for safe use in HTTP headers.
pub fn sanitize_for_header(value: &str, field_name: &str) -> Result<String> {
    if value.is_empty() {
        bail!("{} cannot be empty", field_name);
    }

    for (index, ch) in value.char_indices() {
        let byte = ch as u32;
        if byte <= 0x1F || byte == 0x7F || ch == '\0' || ch == '\r' || ch == '\n' {
            bail!(
                "{} contains invalid character at position {} (byte value: {:#04x})",
                field_name,
                index,
                byte
            );
        }
    }

    Ok(value.to_string())
}

/// Validate an API key can be used in an Authorization header.
pub fn validate_api_key(api_key: &str) -> Result<String> {
    let trimmed = api_key.trim();

    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        bail!("API key is empty or set to 'none'");
    }

    sanitize_for_header(trimmed, "API key")?;

    let header_value = format!("Bearer {}", trimmed);
    header_value
        .parse::<reqwest::header::HeaderValue>()
        .with_context(|| {
            format!(
                "API key results in invalid Authorization header (length {})",
                trimmed.len()
            )
        })?;

    Ok(trimmed.to_string())
}

/// Sanitize a base URL for API requests.
pub fn sanitize_base_url(url: &str, field_name: &str) -> Result<String> {
    let trimmed = url.trim();

    if trimmed.is_empty() {
        bail!("{} cannot be empty", field_name);
    }

    if trimmed.contains("%2F") || trimmed.contains("%3D") || trimmed.contains("%20") {
        bail!(
            "{} appears to contain URL-encoded characters, likely double-encoded",
            field_name
        );
    }

    if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
        bail!("{} must start with 'http://' or 'https://'. Got: {}", field_name, trimmed);
    }

    Ok(trimmed.to_string())
}

fn credential_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"sk-[A-Za-z0-9]{8,}").unwrap(),
            Regex::new(r"(?i)(api[_-]?key)\s*[=:]\s*\S+").unwrap(),
            Regex::new(r"(?i)bearer\s+[A-Za-z0-9._\-]{8,}").unwrap(),
        ]
    })
}

/// Scrub substrings matching common credential patterns before a line is
/// persisted to any log (conversation log files, debug log, tracing events).
pub fn scrub_credentials(text: &str) -> String {
    let mut out = text.to_string();
    for pattern in credential_patterns() {
        out = pattern.replace_all(&out, "[REDACTED]").into_owned();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_for_header_valid() {
        assert!(sanitize_for_header("abc123", "test").is_ok());
        assert!(sanitize_for_header("hello world", "test").is_ok());
    }

    #[test]
    fn test_sanitize_for_header_invalid() {
        assert!(sanitize_for_header("abc\n123", "test").is_err());
        assert!(sanitize_for_header("abc\x00123", "test").is_err());
    }

    #[test]
    fn test_validate_api_key() {
        assert!(validate_api_key("sk-test123").is_ok());
        assert!(validate_api_key("").is_err());
        assert!(validate_api_key("none").is_err());
    }

    #[test]
    fn test_sanitize_base_url() {
        assert!(sanitize_base_url("https://api.example.com/v1", "url").is_ok());
        assert!(sanitize_base_url("invalid-url", "url").is_err());
    }

    #[test]
    fn test_scrub_api_key() {
        let scrubbed = scrub_credentials("calling with sk-abcdefgh12345678 as key");
        assert!(!scrubbed.contains("sk-abcdefgh12345678"));
        assert!(scrubbed.contains("[REDACTED]"));
    }

    #[test]
    fn test_scrub_key_value() {
        let scrubbed = scrub_credentials("API_KEY=supersecretvalue1234");
        assert!(!scrubbed.contains("supersecretvalue1234"));
    }

    #[test]
    fn test_scrub_leaves_normal_text_alone() {
        let text = "the builder produced a clean response";
        assert_eq!(scrub_credentials(text), text);
    }
}
