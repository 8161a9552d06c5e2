//! Step lifecycle coordinator.
//!
//! Moves a step `READY → RUNNING` (claim) and `RUNNING → SUCCEEDED | FAILED`
//! (finalize) with compare-and-swap writes against the flow run's revision.
//! Every write is a set of leaf field paths under `steps.<id>`, so concurrent
//! writers on sibling steps or sibling fields never overwrite each other.
//!
//! Conflicts are retried within a [`RetryPolicy`] and, once the budget is
//! spent, reported as a soft outcome. Other store failures propagate.

use std::sync::{Arc, Mutex, PoisonError};

use chart_worker_types::{ClaimReason, ClaimResult, FinalizeReason, FinalizeResult, StepError, StepStatus};
use chart_worker_util::{
    DocumentKey, DocumentSnapshot, DocumentStore, DocumentStoreError, FieldPath, FieldUpdates, RetryPolicy, field_paths::get_path,
    retry_on_conflict, time::format_rfc3339,
};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::FLOW_RUNS_COLLECTION;

/// Terminal outcome recorded by [`StepCoordinator::finalize`].
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded { outputs_manifest_gcs_uri: String },
    Failed(StepError),
}

impl StepOutcome {
    pub fn status(&self) -> StepStatus {
        match self {
            Self::Succeeded { .. } => StepStatus::Succeeded,
            Self::Failed(_) => StepStatus::Failed,
        }
    }
}

/// Claims and finalizes steps of flow runs held in a [`DocumentStore`].
#[derive(Clone)]
pub struct StepCoordinator {
    store: Arc<dyn DocumentStore>,
    retry: RetryPolicy,
}

impl StepCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::conflicts(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Transitions `step_id` from `READY` to `RUNNING`.
    ///
    /// Only a step observed as `READY` is written, and only its `status` leaf.
    /// A step in any other state (including one already `RUNNING`) is reported
    /// as `not_ready` without a write.
    pub async fn claim(&self, run_id: &str, step_id: &str) -> Result<ClaimResult, DocumentStoreError> {
        let key = flow_run_key(run_id);
        let updates = build_claim_update(step_id);
        let observed = Mutex::new(None);
        let (store, key, updates, observed_ref) = (&self.store, &key, &updates, &observed);

        let outcome = retry_on_conflict(self.retry, "claim_step", move |attempt| async move {
            let snapshot = store.get(key).await?;
            let status = record_status(observed_ref, &snapshot, step_id);
            if status != Some(StepStatus::Ready) {
                return Ok(ClaimResult::skipped(status, ClaimReason::NotReady));
            }
            store.update(key, updates, snapshot.precondition()).await?;
            debug!(run_id, step_id, attempt, "step_claim_written");
            Ok::<_, DocumentStoreError>(ClaimResult::claimed(status))
        })
        .await;

        match outcome {
            Ok(result) => {
                if result.claimed {
                    info!(run_id, step_id, "step_claimed");
                } else {
                    info!(run_id, step_id, status = ?result.status, reason = "not_ready", "step_claim_skipped");
                }
                Ok(result)
            }
            Err(error) if error.is_conflict() => {
                let reason = if error.is_aborted() {
                    ClaimReason::Aborted
                } else {
                    ClaimReason::PreconditionFailed
                };
                let status = last_observed(observed);
                warn!(run_id, step_id, status = ?status, reason = ?reason, error = %error, "step_claim_conflict");
                Ok(ClaimResult::skipped(status, reason))
            }
            Err(error) => Err(error),
        }
    }

    /// Records the terminal outcome of a `RUNNING` step.
    ///
    /// A step that is already terminal keeps its recorded result and artifact
    /// pointer; the call reports `already_final`.
    pub async fn finalize(
        &self,
        run_id: &str,
        step_id: &str,
        outcome: &StepOutcome,
        finished_at: DateTime<Utc>,
    ) -> Result<FinalizeResult, DocumentStoreError> {
        let key = flow_run_key(run_id);
        let updates = build_finalize_update(step_id, outcome, finished_at);
        let observed = Mutex::new(None);
        let (store, key, updates, observed_ref) = (&self.store, &key, &updates, &observed);

        let result = retry_on_conflict(self.retry, "finalize_step", move |_| async move {
            let snapshot = store.get(key).await?;
            let status = record_status(observed_ref, &snapshot, step_id);
            match status {
                Some(current) if current.is_terminal() => {
                    return Ok(FinalizeResult::skipped(status, FinalizeReason::AlreadyFinal));
                }
                Some(StepStatus::Running) => {}
                _ => return Ok(FinalizeResult::skipped(status, FinalizeReason::NotRunning)),
            }
            store.update(key, updates, snapshot.precondition()).await?;
            Ok::<_, DocumentStoreError>(FinalizeResult::updated(status))
        })
        .await;

        match result {
            Ok(result) if result.updated => {
                info!(run_id, step_id, status = %outcome.status(), "step_finalized");
                Ok(result)
            }
            Ok(result) => {
                info!(run_id, step_id, status = ?result.status, reason = ?result.reason, "step_finalize_skipped");
                Ok(result)
            }
            Err(error) if error.is_conflict() => {
                let reason = if error.is_aborted() {
                    FinalizeReason::Aborted
                } else {
                    FinalizeReason::PreconditionFailed
                };
                let status = last_observed(observed);
                warn!(run_id, step_id, status = ?status, reason = ?reason, error = %error, "step_finalize_skipped");
                Ok(FinalizeResult::skipped(status, reason))
            }
            Err(error) => Err(error),
        }
    }
}

/// Key of a flow run document.
pub fn flow_run_key(run_id: &str) -> DocumentKey {
    DocumentKey::new(FLOW_RUNS_COLLECTION, run_id)
}

/// Path of `steps.<step_id>` inside a flow run.
pub fn step_path(step_id: &str) -> FieldPath {
    FieldPath::new(["steps", step_id])
}

/// Leaf updates that mark a step as claimed.
pub fn build_claim_update(step_id: &str) -> FieldUpdates {
    FieldUpdates::new().set(step_path(step_id).child("status"), StepStatus::Running.as_str())
}

/// Leaf updates that record a terminal outcome.
///
/// `error.details` is written only when the error carries details.
pub fn build_finalize_update(step_id: &str, outcome: &StepOutcome, finished_at: DateTime<Utc>) -> FieldUpdates {
    let step = step_path(step_id);
    let updates = FieldUpdates::new()
        .set(step.child("status"), outcome.status().as_str())
        .set(step.child("finishedAt"), format_rfc3339(finished_at));

    match outcome {
        StepOutcome::Succeeded { outputs_manifest_gcs_uri } => updates.set(
            step.child("outputs").child("outputsManifestGcsUri"),
            json!(outputs_manifest_gcs_uri),
        ),
        StepOutcome::Failed(error) => {
            let error_path = step.child("error");
            let updates = updates
                .set(error_path.child("code"), error.code.as_str())
                .set(error_path.child("message"), error.message.clone());
            match &error.details {
                Some(details) => updates.set(error_path.child("details"), details.clone()),
                None => updates,
            }
        }
    }
}

/// Reads the step status and remembers it for reporting after retries run out.
fn record_status(observed: &Mutex<Option<StepStatus>>, snapshot: &DocumentSnapshot, step_id: &str) -> Option<StepStatus> {
    let status = step_status(snapshot, step_id);
    *observed.lock().unwrap_or_else(PoisonError::into_inner) = status;
    status
}

fn last_observed(observed: Mutex<Option<StepStatus>>) -> Option<StepStatus> {
    observed.into_inner().unwrap_or_else(PoisonError::into_inner)
}

fn step_status(snapshot: &DocumentSnapshot, step_id: &str) -> Option<StepStatus> {
    let data = snapshot.data.as_ref()?;
    get_path(data, &step_path(step_id).child("status"))
        .and_then(Value::as_str)
        .map(StepStatus::parse)
}
