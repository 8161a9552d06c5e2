//! Entry point for Firestore update events on `flow_runs`.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{Instrument, info, info_span};

use chart_worker_types::FlowRun;

use crate::{
    driver::{DriverError, RunResult, StepRuntime, log_blocked, run_chart_export_step},
    ingest::{CloudEvent, is_firestore_update_event, parse_flow_run_event},
    selection::pick_ready_chart_export_step,
};

/// What happened to one delivered event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum EventOutcome {
    /// The event is not a flow run update this worker acts on.
    Ignored { reason: &'static str },
    /// The flow run has nothing eligible to run.
    Noop { reason: &'static str },
    Ran(RunResult),
}

/// Handles one CloudEvent.
///
/// Events are filtered by type and subject, decoded, and the step runs only when
/// a ready chart export step has every dependency succeeded. Redelivered events
/// are harmless because the claim lets one invocation through.
pub async fn handle_cloud_event(event: &CloudEvent, runtime: &StepRuntime) -> Result<EventOutcome, DriverError> {
    let span = info_span!(
        "cloud_event",
        service = %runtime.config.service,
        env = runtime.config.env.as_deref().unwrap_or_default(),
        event_id = event.id.as_deref().unwrap_or_default(),
        event_type = event.event_type.as_deref().unwrap_or_default(),
        subject = event.subject.as_deref().unwrap_or_default(),
    );
    handle(event, runtime).instrument(span).await
}

async fn handle(event: &CloudEvent, runtime: &StepRuntime) -> Result<EventOutcome, DriverError> {
    info!("cloud_event_received");

    if !is_firestore_update_event(event.event_type.as_deref()) {
        return Ok(ignored("event_type_filtered"));
    }
    let Some(parsed) = parse_flow_run_event(event) else {
        return Ok(ignored("event_filtered"));
    };

    let document = parsed.flow_run;
    let flow_key = document.get("flowKey").and_then(Value::as_str).unwrap_or_default().to_string();
    let span = info_span!("flow_run", run_id = %parsed.run_id, flow_key = %flow_key);
    handle_flow_run(parsed.run_id, document, runtime).instrument(span).await
}

async fn handle_flow_run(run_id: String, mut document: Map<String, Value>, runtime: &StepRuntime) -> Result<EventOutcome, DriverError> {
    if !document.get("steps").is_some_and(Value::is_object) {
        return Ok(ignored("invalid_steps"));
    }
    // The subject is authoritative for the document id.
    document.insert("runId".into(), Value::String(run_id));
    let document = Value::Object(document);

    let pick = match FlowRun::from_value(document.clone()) {
        Ok(flow_run) => pick_ready_chart_export_step(&flow_run),
        Err(error) => {
            info!(error = %error, "flow_run_undecodable");
            return Ok(ignored("invalid_steps"));
        }
    };
    log_blocked(&pick.blocked);
    let Some(step_id) = pick.step_id else {
        info!(reason = "no_ready_step", "cloud_event_noop");
        return Ok(EventOutcome::Noop { reason: "no_ready_step" });
    };
    info!(step_id = %step_id, "ready_step_selected");

    let result = run_chart_export_step(&document, Some(&step_id), runtime).await?;
    info!(
        step_id = %step_id,
        status = %result.status,
        outputs_manifest_gcs_uri = result.outputs_manifest_gcs_uri.as_deref().unwrap_or_default(),
        items_count = result.items_count,
        failures_count = result.failures_count,
        error_code = ?result.error_code,
        "cloud_event_finished"
    );
    Ok(EventOutcome::Ran(result))
}

fn ignored(reason: &'static str) -> EventOutcome {
    info!(reason, "cloud_event_ignored");
    EventOutcome::Ignored { reason }
}
