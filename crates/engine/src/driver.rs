//! End-to-end execution of one chart export step.
//!
//! The driver only sequences the other modules: pick or verify the step,
//! claim it, build requests, fetch each chart through the account pool,
//! publish PNGs and the manifest, and finalize. Claim always precedes any
//! chart API call, and finalize is always the last write.

use std::{fmt, sync::Arc};

use chart_worker_api::ChartRenderer;
use chart_worker_types::{ErrorCode, FlowRun, ManifestFailure, Step, StepError};
use chart_worker_util::{Clock, DocumentStore, DocumentStoreError, ObjectStore, RetryPolicy, SystemClock};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    allocator::AccountAllocator,
    artifacts::{GeneratedAt, ManifestContext, PngUpload, build_manifest, symbol_slug, upload_pngs, validate_manifest, write_manifest},
    config::WorkerConfig,
    lifecycle::{StepCoordinator, StepOutcome},
    orchestrator::{AllocatorPool, fetch_with_retries},
    selection::{BlockedStep, pick_ready_chart_export_step, unmet_dependencies},
    templates::{RequestContext, StoredTemplates, build_chart_requests},
};

/// Collaborators and settings for step execution.
#[derive(Clone)]
pub struct StepRuntime {
    pub config: WorkerConfig,
    pub documents: Arc<dyn DocumentStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub renderer: Arc<dyn ChartRenderer>,
    pub clock: Arc<dyn Clock>,
    /// Budget for claim, finalize and usage write conflicts.
    pub conflict_retry: RetryPolicy,
    /// Budget for chart API calls of a single request.
    pub fetch_retry: RetryPolicy,
}

impl StepRuntime {
    pub fn new(
        config: WorkerConfig,
        documents: Arc<dyn DocumentStore>,
        objects: Arc<dyn ObjectStore>,
        renderer: Arc<dyn ChartRenderer>,
    ) -> Self {
        Self {
            config,
            documents,
            objects,
            renderer,
            clock: Arc::new(SystemClock),
            conflict_retry: RetryPolicy::conflicts(),
            fetch_retry: RetryPolicy::chart_fetch(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policies(mut self, conflict_retry: RetryPolicy, fetch_retry: RetryPolicy) -> Self {
        self.conflict_retry = conflict_retry;
        self.fetch_retry = fetch_retry;
        self
    }

    fn coordinator(&self) -> StepCoordinator {
        StepCoordinator::new(self.documents.clone()).with_retry(self.conflict_retry)
    }

    fn account_pool(&self) -> AllocatorPool {
        let allocator = AccountAllocator::new(self.documents.clone())
            .with_default_daily_limit(self.config.chart_img_daily_limit)
            .with_retry(self.conflict_retry);
        AllocatorPool::new(allocator, self.config.chart_img_accounts.clone(), self.clock.clone())
    }
}

/// Final status of one driver invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Succeeded,
    Failed,
    /// The step could not be claimed; another invocation owns it.
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one driver invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub status: RunStatus,
    pub run_id: Option<String>,
    pub step_id: Option<String>,
    pub outputs_manifest_gcs_uri: Option<String>,
    pub items_count: usize,
    pub failures_count: usize,
    pub min_images: Option<u32>,
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

impl RunResult {
    fn new(status: RunStatus, run_id: Option<&str>, step_id: Option<&str>) -> Self {
        Self {
            status,
            run_id: run_id.map(str::to_string),
            step_id: step_id.map(str::to_string),
            outputs_manifest_gcs_uri: None,
            items_count: 0,
            failures_count: 0,
            min_images: None,
            error_code: None,
            error: None,
        }
    }

    fn failed(run_id: Option<&str>, step_id: Option<&str>, error: StepError) -> Self {
        Self {
            error_code: Some(error.code),
            error: Some(error),
            ..Self::new(RunStatus::Failed, run_id, step_id)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

/// Failures that abort a run without a recorded step outcome.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Store(#[from] DocumentStoreError),
}

/// Executes one chart export step of `flow_run`.
///
/// With `step_id` set, that step must exist, be a chart export step and have
/// every dependency succeeded; otherwise the ready step with the smallest id
/// is picked. Input problems found before the claim produce a `FAILED` result
/// without touching the store.
pub async fn run_chart_export_step(flow_run: &serde_json::Value, step_id: Option<&str>, runtime: &StepRuntime) -> Result<RunResult, DriverError> {
    let flow_run = match FlowRun::from_value(flow_run.clone()) {
        Ok(flow_run) => flow_run,
        Err(error) => {
            let error = StepError::validation("Flow run document is malformed").with_details(json!({"error": error.to_string()}));
            warn!(error = %error.message, "flow_run_rejected");
            return Ok(RunResult::failed(None, step_id, error));
        }
    };

    let Some(run_id) = flow_run.run_id.as_deref().filter(|run_id| !run_id.trim().is_empty()) else {
        warn!("flow_run_missing_run_id");
        return Ok(RunResult::failed(None, step_id, StepError::validation("runId is required")));
    };

    let (step_id, step) = match resolve_step(&flow_run, step_id) {
        Ok(resolved) => resolved,
        Err(error) => {
            warn!(run_id, step_id = ?step_id, error = %error.message, "step_rejected");
            return Ok(RunResult::failed(Some(run_id), step_id, error));
        }
    };

    let coordinator = runtime.coordinator();
    let claim = coordinator.claim(run_id, step_id).await?;
    if !claim.claimed {
        return Ok(RunResult::new(RunStatus::Skipped, Some(run_id), Some(step_id)));
    }

    let execution = StepExecution {
        runtime,
        coordinator: &coordinator,
        flow_run: &flow_run,
        run_id,
        step_id,
        step,
    };
    execution.run().await
}

fn resolve_step<'a>(flow_run: &'a FlowRun, requested: Option<&'a str>) -> Result<(&'a str, &'a Step), StepError> {
    let Some(step_id) = requested else {
        let pick = pick_ready_chart_export_step(flow_run);
        log_blocked(&pick.blocked);
        let Some(step_id) = pick.step_id else {
            return Err(StepError::validation("No READY CHART_EXPORT step found"));
        };
        let (step_id, step) = flow_run
            .steps
            .get_key_value(step_id.as_str())
            .ok_or_else(|| StepError::validation("Step not found"))?;
        return Ok((step_id.as_str(), step));
    };

    let step = flow_run
        .step(step_id)
        .ok_or_else(|| StepError::validation("Step not found").with_details(json!({"stepId": step_id})))?;
    if !step.is_chart_export() {
        return Err(StepError::validation("Step is not a CHART_EXPORT step").with_details(json!({
            "stepId": step_id,
            "stepType": step.step_type,
        })));
    }
    let unmet = unmet_dependencies(flow_run, step);
    if !unmet.is_empty() {
        let blocked = BlockedStep {
            step_id: step_id.to_string(),
            unmet,
        };
        log_blocked(std::slice::from_ref(&blocked));
        return Err(StepError::validation("Step dependencies are not satisfied").with_details(json!(blocked)));
    }
    Ok((step_id, step))
}

pub(crate) fn log_blocked(blocked: &[BlockedStep]) {
    for step in blocked {
        let unmet: Vec<String> = step
            .unmet
            .iter()
            .map(|dependency| {
                let status = dependency.status.map_or("MISSING", |status| status.as_str());
                format!("{}={status}", dependency.step_id)
            })
            .collect();
        info!(step_id = %step.step_id, unmet = ?unmet, "step_blocked_by_dependencies");
    }
}

/// A claimed step being worked on.
struct StepExecution<'a> {
    runtime: &'a StepRuntime,
    coordinator: &'a StepCoordinator,
    flow_run: &'a FlowRun,
    run_id: &'a str,
    step_id: &'a str,
    step: &'a Step,
}

impl StepExecution<'_> {
    async fn run(&self) -> Result<RunResult, DriverError> {
        let Some(timeframe) = self.step.timeframe.as_deref().filter(|timeframe| !timeframe.trim().is_empty()) else {
            return self.fail_before_fetch(StepError::validation("timeframe is required").with_details(json!({"stepId": self.step_id}))).await;
        };
        let scope_symbol = self.flow_run.scope.symbol.as_deref().unwrap_or_default();
        let requests = &self.step.inputs.requests;

        let context = RequestContext {
            scope_symbol,
            timeframe,
            default_timezone: &self.runtime.config.charts_default_timezone,
        };
        let templates = StoredTemplates::new(self.runtime.documents.clone());
        let built = match build_chart_requests(requests, self.step.inputs.min_images, context, &templates).await? {
            Ok(built) => built,
            Err(error) => return self.fail_before_fetch(error).await,
        };

        let mut failures: Vec<ManifestFailure> = built
            .failures
            .into_iter()
            .map(|failure| ManifestFailure {
                request: json!({"chartTemplateId": failure.chart_template_id}),
                error: failure.error,
            })
            .collect();

        let pool = self.runtime.account_pool();
        let slug = symbol_slug(scope_symbol);
        let mut uploads = Vec::new();
        for item in &built.items {
            let request = &item.request;
            let fetched = fetch_with_retries(self.runtime.renderer.as_ref(), &pool, request, self.runtime.fetch_retry).await?;
            match fetched.result {
                Ok(chart) => uploads.push(PngUpload {
                    chart_template_id: request.chart_template_id.clone(),
                    kind: item.kind.clone(),
                    png: chart.png,
                    generated_at: GeneratedAt::new(self.runtime.clock.now()),
                    symbol_slug: slug.clone(),
                    timeframe: timeframe.to_string(),
                }),
                Err(error) => {
                    warn!(
                        run_id = self.run_id,
                        step_id = self.step_id,
                        chart_template_id = %request.chart_template_id,
                        error_code = %error.code,
                        http_status = ?error.http_status,
                        attempts = fetched.attempts,
                        exhausted_accounts = ?fetched.exhausted_accounts,
                        "chart_request_failed"
                    );
                    failures.push(ManifestFailure {
                        request: json!({"chartTemplateId": request.chart_template_id}),
                        error: error.into(),
                    });
                }
            }
        }

        let uploaded = upload_pngs(self.runtime.objects.as_ref(), self.run_id, &uploads).await;
        failures.extend(uploaded.failures);
        let items = uploaded.items;

        let min_images = self
            .step
            .inputs
            .min_images
            .and_then(|min| u32::try_from(min).ok())
            .unwrap_or_else(|| u32::try_from(requests.len()).unwrap_or(u32::MAX));
        let manifest = build_manifest(
            ManifestContext {
                run_id: self.run_id,
                step_id: self.step_id,
                symbol: scope_symbol,
                timeframe,
                min_images,
                requested: requests,
            },
            self.runtime.clock.now(),
            items,
            failures,
        );

        let mut result = RunResult::new(RunStatus::Failed, Some(self.run_id), Some(self.step_id));
        result.items_count = manifest.items.len();
        result.failures_count = manifest.failures.len();
        result.min_images = Some(min_images);

        let published = match validate_manifest(&manifest) {
            Ok(()) => write_manifest(self.runtime.objects.as_ref(), &manifest).await,
            Err(error) => Err(error),
        };
        let outcome = match published {
            Ok(uri) => {
                result.outputs_manifest_gcs_uri = Some(uri.clone());
                if manifest.items.len() >= min_images as usize {
                    StepOutcome::Succeeded {
                        outputs_manifest_gcs_uri: uri,
                    }
                } else {
                    StepOutcome::Failed(representative_error(&manifest.failures, manifest.items.len(), min_images))
                }
            }
            Err(error) => StepOutcome::Failed(error),
        };

        self.finalize(&outcome).await?;
        match outcome {
            StepOutcome::Succeeded { .. } => result.status = RunStatus::Succeeded,
            StepOutcome::Failed(error) => {
                result.error_code = Some(error.code);
                result.error = Some(error);
            }
        }
        info!(
            run_id = self.run_id,
            step_id = self.step_id,
            status = %result.status,
            items = result.items_count,
            failures = result.failures_count,
            min_images,
            "chart_export_finished"
        );
        Ok(result)
    }

    /// Finalizes `FAILED` after a step-wide problem found before any chart call.
    async fn fail_before_fetch(&self, error: StepError) -> Result<RunResult, DriverError> {
        warn!(run_id = self.run_id, step_id = self.step_id, error_code = %error.code, error = %error.message, "step_validation_failed");
        self.finalize(&StepOutcome::Failed(error.clone())).await?;
        Ok(RunResult::failed(Some(self.run_id), Some(self.step_id), error))
    }

    async fn finalize(&self, outcome: &StepOutcome) -> Result<(), DriverError> {
        self.coordinator
            .finalize(self.run_id, self.step_id, outcome, self.runtime.clock.now())
            .await?;
        Ok(())
    }
}

/// The first recorded failure stands for the step; without one the shortfall itself is reported.
fn representative_error(failures: &[ManifestFailure], items: usize, min_images: u32) -> StepError {
    failures.first().map(|failure| failure.error.clone()).unwrap_or_else(|| {
        StepError::validation("Not enough chart images were produced").with_details(json!({
            "itemsCount": items,
            "minImages": min_images,
        }))
    })
}
