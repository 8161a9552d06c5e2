//! Outputs manifest published next to the rendered charts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::StepError, flow::ChartRequest};

/// Current manifest schema version.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Outputs manifest for one chart export step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    pub run_id: String,
    pub step_id: String,
    /// RFC 3339 creation time.
    pub created_at: String,
    pub symbol: String,
    pub timeframe: String,
    pub min_images: u32,
    /// The step's request list, as authored.
    pub requested: Vec<ChartRequest>,
    pub items: Vec<ManifestItem>,
    /// Omitted entirely when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ManifestFailure>,
}

/// One produced chart image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestItem {
    pub chart_template_id: String,
    /// Human readable kind, taken from the template description.
    pub kind: String,
    pub generated_at: String,
    #[serde(rename = "png_gcs_uri")]
    pub png_gcs_uri: String,
}

/// One request that did not produce an image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestFailure {
    /// Identifies the failed request, typically `{"chartTemplateId": ...}`.
    pub request: Value,
    pub error: StepError,
}
