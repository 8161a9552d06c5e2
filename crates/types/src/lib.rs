//! Shared type definitions for the chart export worker.
//!
//! Everything in this crate is plain data: the shape of a flow run document and
//! its steps, the closed error taxonomy reported by chart requests, the account
//! usage records kept per Chart-IMG account, the outcomes of claim/finalize
//! writes, and the outputs manifest published next to the rendered charts.
//! No I/O happens here; the engine and util crates own all store access.

pub mod account;
pub mod error;
pub mod flow;
pub mod manifest;
pub mod outcome;

pub use account::{AccountUsage, ChartImgAccount, ChartsApiMode, ParseChartsApiModeError};
pub use error::{ChartApiError, ErrorCode, StepError};
pub use flow::{CHART_EXPORT_STEP_TYPE, ChartRequest, FlowRun, FlowScope, Step, StepInputs, StepStatus};
pub use manifest::{MANIFEST_SCHEMA_VERSION, Manifest, ManifestFailure, ManifestItem};
pub use outcome::{ClaimReason, ClaimResult, FinalizeReason, FinalizeResult};
