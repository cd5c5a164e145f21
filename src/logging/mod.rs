//! Tracing setup and redaction of secrets in text that leaves the core.

use once_cell::sync::Lazy;
use regex::Regex;

/// Maximum length of a reason string before truncation
const MAX_LINE_LENGTH: usize = 512;

/// Default filter when RUST_LOG is not set
const DEFAULT_FILTER: &str = "remux=info,warn";

/// Sensitive patterns to redact
static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // SSH private key blocks
        r"(?s)-----BEGIN[^-]*PRIVATE KEY-----.*?-----END[^-]*PRIVATE KEY-----",
        r"(?s)-----BEGIN[^-]*KEY-----.*?-----END[^-]*KEY-----",
        // Authorization headers
        r"(?i)authorization\s*:\s*(bearer|basic)\s+[^\s]+",
        // Generic secrets by key name (key=value patterns)
        r#"(?i)(password|passwd|pwd|secret|token|private[_-]?key|passphrase)\s*[:=]\s*["']?[^\s"']+["']?"#,
        // Long base64 blobs (key material)
        r"[A-Za-z0-9+/]{64,}={0,2}",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Install the global tracing subscriber. Safe to call more than once.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .try_init();
}

/// Sanitize a string by removing sensitive information
pub fn sanitize(input: &str) -> String {
    let mut result = input.to_string();

    for pattern in SENSITIVE_PATTERNS.iter() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }

    if result.len() > MAX_LINE_LENGTH {
        let mut cut = MAX_LINE_LENGTH;
        while !result.is_char_boundary(cut) {
            cut -= 1;
        }
        result = format!("{}... [truncated]", &result[..cut]);
    }

    result
}
