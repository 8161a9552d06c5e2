//! Chart-IMG accounts and their daily usage records.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One quota-limited Chart-IMG credential from the configured pool.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChartImgAccount {
    /// Stable identifier; also the document id in `chart_img_accounts_usage`.
    pub id: String,
    /// Value sent in the `x-api-key` header.
    pub api_key: String,
    /// Per-account daily quota overriding the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_limit: Option<u32>,
}

impl ChartImgAccount {
    pub fn new(id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            api_key: api_key.into(),
            daily_limit: None,
        }
    }

    pub fn with_daily_limit(mut self, daily_limit: u32) -> Self {
        self.daily_limit = Some(daily_limit);
        self
    }
}

// API keys never reach logs through `{:?}`.
impl fmt::Debug for ChartImgAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChartImgAccount")
            .field("id", &self.id)
            .field("api_key", &"<redacted>")
            .field("daily_limit", &self.daily_limit)
            .finish()
    }
}

/// Snapshot of an account's usage after an allocator write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AccountUsage {
    pub account_id: String,
    /// Calls counted against the current UTC day, including the one just claimed.
    pub usage_today: u32,
    pub daily_limit: u32,
    /// RFC 3339 start of the UTC day the counter belongs to.
    pub window_start: String,
}

impl AccountUsage {
    pub fn is_exhausted(&self) -> bool {
        self.usage_today >= self.daily_limit
    }
}

/// How the chart client obtains images.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChartsApiMode {
    /// Call the live API.
    #[default]
    Real,
    /// Serve deterministic fixtures; never touch the network.
    Mock,
    /// Serve fixtures when present, otherwise call the API and store the result.
    Record,
}

impl ChartsApiMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Real => "real",
            Self::Mock => "mock",
            Self::Record => "record",
        }
    }
}

impl fmt::Display for ChartsApiMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("charts API mode must be one of: real|mock|record (got '{0}')")]
pub struct ParseChartsApiModeError(String);

impl FromStr for ChartsApiMode {
    type Err = ParseChartsApiModeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "real" => Ok(Self::Real),
            "mock" => Ok(Self::Mock),
            "record" => Ok(Self::Record),
            other => Err(ParseChartsApiModeError(other.to_string())),
        }
    }
}
