//! Flow run and step records as stored in the `flow_runs` collection.
//!
//! The worker only ever reads whole flow runs; writes go through field-path
//! updates on individual steps. The structs here are therefore lenient on input
//! (every field defaults) so that an unrelated malformed sibling field never
//! prevents a step from being picked.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Step type handled by this worker.
pub const CHART_EXPORT_STEP_TYPE: &str = "CHART_EXPORT";

/// A single execution of a multi-step flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowRun {
    /// Identifier of the run; also the document id in `flow_runs`.
    #[serde(default)]
    pub run_id: Option<String>,
    /// Key of the flow definition this run was planned from.
    #[serde(default)]
    pub flow_key: Option<String>,
    /// Run-wide scope shared by all steps.
    #[serde(default)]
    pub scope: FlowScope,
    /// Steps keyed by step id. Order carries no meaning.
    #[serde(default)]
    pub steps: IndexMap<String, Step>,
}

impl FlowRun {
    /// Parses a flow run from a raw JSON document.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Returns the step with the given id.
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.get(step_id)
    }

    /// Returns the scope symbol when it is a non-empty string.
    pub fn scope_symbol(&self) -> Option<&str> {
        self.scope.symbol.as_deref().filter(|symbol| !symbol.trim().is_empty())
    }
}

/// Run-wide scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlowScope {
    /// Base symbol (for example `BTCUSDT`) rendered into chart templates.
    #[serde(default)]
    pub symbol: Option<String>,
}

/// One unit of work inside a flow run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Step kind; only [`CHART_EXPORT_STEP_TYPE`] is handled here.
    #[serde(default)]
    pub step_type: Option<String>,
    /// Lifecycle status.
    #[serde(default)]
    pub status: Option<StepStatus>,
    /// Chart interval, for example `1h` or `1D`.
    #[serde(default)]
    pub timeframe: Option<String>,
    /// Request list and success threshold.
    #[serde(default)]
    pub inputs: StepInputs,
    /// Free-form outputs. Merged on write, never replaced.
    #[serde(default)]
    pub outputs: Map<String, Value>,
    /// Present only once the step has failed.
    #[serde(default)]
    pub error: Option<Value>,
    /// Ids of steps that must have succeeded before this one may run.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// RFC 3339 timestamp written on finalize.
    #[serde(default)]
    pub finished_at: Option<String>,
}

impl Step {
    /// Returns true when the step is a chart export step.
    pub fn is_chart_export(&self) -> bool {
        self.step_type.as_deref() == Some(CHART_EXPORT_STEP_TYPE)
    }

    /// Returns the current status, or [`StepStatus::Unknown`] when absent.
    pub fn status(&self) -> StepStatus {
        self.status.unwrap_or(StepStatus::Unknown)
    }
}

/// Inputs of a chart export step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepInputs {
    /// Requested chart templates.
    #[serde(default)]
    pub requests: Vec<ChartRequest>,
    /// Minimum number of produced images for the step to succeed.
    /// Defaults to the number of requests.
    #[serde(default)]
    pub min_images: Option<i64>,
}

/// A single chart request as authored by the planner.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartRequest {
    /// Template identifier in the `chart_templates` collection.
    #[serde(default)]
    pub chart_template_id: Option<String>,
    /// Any additional planner fields, carried through to the manifest untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChartRequest {
    /// Builds a request that only names a template.
    pub fn for_template(chart_template_id: impl Into<String>) -> Self {
        Self {
            chart_template_id: Some(chart_template_id.into()),
            extra: Map::new(),
        }
    }

    /// Returns the template id when it is a non-blank string.
    pub fn template_id(&self) -> Option<&str> {
        self.chart_template_id.as_deref().filter(|id| !id.trim().is_empty())
    }
}

/// Step lifecycle status. Transitions are monotonic:
/// `READY → RUNNING → SUCCEEDED | FAILED`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Planned and waiting to be claimed.
    Ready,
    /// Claimed by a worker.
    Running,
    /// Terminal success.
    Succeeded,
    /// Terminal failure.
    Failed,
    /// Any status string this worker does not know about.
    #[serde(other)]
    Unknown,
}

impl StepStatus {
    /// Parses a stored status string; unrecognized values map to `Unknown`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "READY" => Self::Ready,
            "RUNNING" => Self::Running,
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// `SUCCEEDED` and `FAILED` are terminal; writes to them must be no-ops.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
