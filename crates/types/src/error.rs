//! Closed error taxonomy for chart export steps.
//!
//! These are outcome data, not Rust errors: they are written into the flow run
//! (`steps.<id>.error`) and into the outputs manifest, so their wire form is
//! fixed.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error codes surfaced to flow run readers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed input or configuration; nothing external was attempted.
    ValidationFailed,
    /// The fixture-backed client had no fixture for a request.
    ChartApiMockMissing,
    /// The chart API failed for a reason other than quota.
    ChartApiFailed,
    /// Quota exhausted, either reported by the API or found locally.
    ChartApiLimitExceeded,
    /// A chart image could not be written to object storage.
    GcsWriteFailed,
    /// The outputs manifest could not be written to object storage.
    ManifestWriteFailed,
}

impl ErrorCode {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::ChartApiMockMissing => "CHART_API_MOCK_MISSING",
            Self::ChartApiFailed => "CHART_API_FAILED",
            Self::ChartApiLimitExceeded => "CHART_API_LIMIT_EXCEEDED",
            Self::GcsWriteFailed => "GCS_WRITE_FAILED",
            Self::ManifestWriteFailed => "MANIFEST_WRITE_FAILED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error recorded on a failed step and in manifest failure entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl StepError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Shorthand for a `VALIDATION_FAILED` error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Classified failure of a single chart API call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    /// Whether repeating the same call may succeed.
    #[serde(default)]
    pub retriable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

impl ChartApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>, retriable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            http_status: None,
            retriable,
            details: None,
        }
    }

    /// The local allocator found no account with remaining capacity.
    pub fn no_accounts_available() -> Self {
        Self::new(ErrorCode::ChartApiLimitExceeded, "No Chart-IMG accounts available", false)
    }

    pub fn with_status(mut self, http_status: u16) -> Self {
        self.http_status = Some(http_status);
        self
    }

    pub fn with_details(mut self, details: Map<String, Value>) -> Self {
        self.details = Some(details);
        self
    }

    /// True for quota errors that call for rotating to another account.
    pub fn is_limit_exceeded(&self) -> bool {
        self.code == ErrorCode::ChartApiLimitExceeded
    }
}

impl From<ChartApiError> for StepError {
    fn from(error: ChartApiError) -> Self {
        Self {
            code: error.code,
            message: error.message,
            details: error.details.map(Value::Object),
        }
    }
}
