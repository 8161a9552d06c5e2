//! Collaborators shared by the chart worker crates.
//!
//! - [`document_store`]: document store port with conditional writes, plus
//!   in-memory and JSON-file backends.
//! - [`field_paths`]: leaf-scoped field updates.
//! - [`object_store`]: artifact upload port with memory, local-directory and
//!   GCS backends.
//! - [`retry`]: bounded exponential backoff and conflict retry.
//! - [`time`]: injectable UTC clock and timestamp formatting.
//! - [`logging`]: `tracing` subscriber setup.

pub mod document_store;
pub mod field_paths;
pub mod logging;
pub mod object_store;
pub mod retry;
pub mod time;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

pub use document_store::{Document, DocumentKey, DocumentSnapshot, DocumentStore, DocumentStoreError, Precondition, Revision};
pub use field_paths::{FieldPath, FieldUpdates};
pub use object_store::{GcsBucket, ObjectStore, ObjectStoreError};
pub use retry::{RetryPolicy, retry_on_conflict};
pub use time::{Clock, SystemClock};

static REDACT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(authorization:\s*)([^\s,]+(?:\s+[^\s,]+)?)",
        r"(?i)(x-api-key[:=]\s*)([^\s,]+)",
        r#"(?i)("api_?key"\s*:\s*")([^"]*)"#,
        r"(?i)([A-Z0-9_]*?(?:KEY|TOKEN|SECRET|PASSWORD)=)([^\s]+)",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Redacts values that look like credentials in a string.
///
/// Covers authorization headers, `x-api-key` values, `apiKey` JSON fields and
/// `*_KEY=`/`*_TOKEN=`-style assignments. The key part is kept so the output
/// stays readable.
pub fn redact_sensitive(input: &str) -> String {
    let mut redacted = input.to_string();
    for pattern in REDACT_PATTERNS.iter() {
        redacted = pattern
            .replace_all(&redacted, |caps: &Captures| {
                let prefix = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                format!("{prefix}<redacted>")
            })
            .into_owned();
    }
    redacted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_api_keys_and_tokens() {
        assert_eq!(redact_sensitive("x-api-key: abc123"), "x-api-key: <redacted>");
        assert_eq!(
            redact_sensitive(r#"[{"id":"a","apiKey":"secret"}]"#),
            r#"[{"id":"a","apiKey":"<redacted>"}]"#
        );
        assert_eq!(redact_sensitive("GCS_ACCESS_TOKEN=ya29.abc"), "GCS_ACCESS_TOKEN=<redacted>");
        assert_eq!(redact_sensitive("Authorization: Bearer abc"), "Authorization: <redacted>");
    }

    #[test]
    fn leaves_plain_text_alone() {
        assert_eq!(redact_sensitive("chart rendered for BINANCE:BTCUSDT"), "chart rendered for BINANCE:BTCUSDT");
    }
}
