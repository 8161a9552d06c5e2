//! Process-wide `tracing` subscriber setup.

use std::env;

use tracing_subscriber::EnvFilter;

/// Output format of log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event. The default, for log collectors.
    Json,
    /// Human-readable lines for local runs.
    Text,
}

impl LogFormat {
    /// Parses `LOG_FORMAT`; anything other than `text` means JSON.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|value| value.trim().to_ascii_lowercase()) {
            Some(value) if value == "text" => Self::Text,
            _ => Self::Json,
        }
    }
}

/// Filter directive from `RUST_LOG`, then `LOG_LEVEL`, then `info`.
pub fn filter_directive(rust_log: Option<&str>, log_level: Option<&str>) -> String {
    [rust_log, log_level]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "info".to_string())
}

/// Installs the global subscriber. Later calls are no-ops.
pub fn init_tracing() {
    let directive = filter_directive(env::var("RUST_LOG").ok().as_deref(), env::var("LOG_LEVEL").ok().as_deref());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);

    let _ = match LogFormat::parse(env::var("LOG_FORMAT").ok().as_deref()) {
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
        LogFormat::Text => builder.try_init(),
    };
}
