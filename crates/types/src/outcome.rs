//! Outcomes of claim and finalize writes. Returned to callers, never persisted.

use serde::{Deserialize, Serialize};

use crate::flow::StepStatus;

/// Why a claim did not transition the step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClaimReason {
    /// The step was not `READY`; usually another worker already claimed it.
    NotReady,
    /// The document kept changing underneath us until retries ran out.
    PreconditionFailed,
    /// The store aborted the write until retries ran out.
    Aborted,
}

/// Result of claiming a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimResult {
    pub claimed: bool,
    /// Status observed before the claim (or at the last read when not claimed).
    pub status: Option<StepStatus>,
    pub reason: Option<ClaimReason>,
}

impl ClaimResult {
    pub fn claimed(previous: Option<StepStatus>) -> Self {
        Self {
            claimed: true,
            status: previous,
            reason: None,
        }
    }

    pub fn skipped(status: Option<StepStatus>, reason: ClaimReason) -> Self {
        Self {
            claimed: false,
            status,
            reason: Some(reason),
        }
    }
}

/// Why a finalize did not write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeReason {
    /// The step already holds a terminal result, which is kept as is.
    AlreadyFinal,
    /// The step was never claimed.
    NotRunning,
    PreconditionFailed,
    Aborted,
}

/// Result of finalizing a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FinalizeResult {
    pub updated: bool,
    pub status: Option<StepStatus>,
    pub reason: Option<FinalizeReason>,
}

impl FinalizeResult {
    pub fn updated(previous: Option<StepStatus>) -> Self {
        Self {
            updated: true,
            status: previous,
            reason: None,
        }
    }

    pub fn skipped(status: Option<StepStatus>, reason: FinalizeReason) -> Self {
        Self {
            updated: false,
            status,
            reason: Some(reason),
        }
    }
}
