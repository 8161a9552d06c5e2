//! Picks the chart export step a run should work on.
//!
//! A step is eligible when it is a `CHART_EXPORT` step in `READY` and every
//! step it depends on has `SUCCEEDED`. Among eligible steps the
//! lexicographically smallest id wins, so concurrent invocations that see the
//! same flow run converge on the same step.

use chart_worker_types::{FlowRun, Step, StepStatus};
use serde::Serialize;

/// A dependency that keeps a step from running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmetDependency {
    pub step_id: String,
    /// `None` when the dependency does not exist in the flow run.
    pub status: Option<StepStatus>,
}

/// A `READY` chart export step held back by its dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedStep {
    pub step_id: String,
    pub unmet: Vec<UnmetDependency>,
}

/// Outcome of [`pick_ready_chart_export_step`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepPick {
    pub step_id: Option<String>,
    /// Ready steps that were skipped, ordered by step id.
    pub blocked: Vec<BlockedStep>,
}

/// Dependencies of `step` that have not succeeded, in declaration order.
pub fn unmet_dependencies(flow_run: &FlowRun, step: &Step) -> Vec<UnmetDependency> {
    step.depends_on
        .iter()
        .filter_map(|dependency_id| {
            let status = flow_run.step(dependency_id).and_then(|dependency| dependency.status);
            (status != Some(StepStatus::Succeeded)).then(|| UnmetDependency {
                step_id: dependency_id.clone(),
                status,
            })
        })
        .collect()
}

/// Selects the eligible chart export step with the smallest id.
pub fn pick_ready_chart_export_step(flow_run: &FlowRun) -> StepPick {
    let mut ready: Vec<(&String, &Step)> = flow_run
        .steps
        .iter()
        .filter(|(_, step)| step.is_chart_export() && step.status() == StepStatus::Ready)
        .collect();
    ready.sort_by(|(left, _), (right, _)| left.cmp(right));

    let mut pick = StepPick::default();
    for (step_id, step) in ready {
        let unmet = unmet_dependencies(flow_run, step);
        if unmet.is_empty() {
            if pick.step_id.is_none() {
                pick.step_id = Some(step_id.clone());
            }
        } else {
            pick.blocked.push(BlockedStep {
                step_id: step_id.clone(),
                unmet,
            });
        }
    }
    pick
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flow_run(steps: serde_json::Value) -> FlowRun {
        FlowRun::from_value(json!({"runId": "run-1", "scope": {"symbol": "BTCUSDT"}, "steps": steps})).unwrap()
    }

    #[test]
    fn ready_step_with_unmet_dependency_is_blocked() {
        let run = flow_run(json!({
            "stepA": {"stepType": "CHART_EXPORT", "status": "READY", "dependsOn": ["stepB"]},
            "stepB": {"stepType": "OTHER", "status": "READY"}
        }));

        let pick = pick_ready_chart_export_step(&run);

        assert_eq!(pick.step_id, None);
        assert_eq!(
            pick.blocked,
            vec![BlockedStep {
                step_id: "stepA".into(),
                unmet: vec![UnmetDependency {
                    step_id: "stepB".into(),
                    status: Some(StepStatus::Ready),
                }],
            }]
        );
    }

    #[test]
    fn satisfied_dependencies_make_step_eligible() {
        let run = flow_run(json!({
            "stepA": {"stepType": "CHART_EXPORT", "status": "READY", "dependsOn": ["stepB"]},
            "stepB": {"stepType": "OTHER", "status": "SUCCEEDED"}
        }));

        let pick = pick_ready_chart_export_step(&run);
        assert_eq!(pick.step_id.as_deref(), Some("stepA"));
        assert!(pick.blocked.is_empty());
    }

    #[test]
    fn eligible_step_is_picked_past_blocked_ones() {
        let run = flow_run(json!({
            "stepA": {"stepType": "CHART_EXPORT", "status": "READY", "dependsOn": ["stepB"]},
            "stepB": {"stepType": "OTHER", "status": "READY"},
            "stepC": {"stepType": "CHART_EXPORT", "status": "READY", "dependsOn": []}
        }));

        let pick = pick_ready_chart_export_step(&run);
        assert_eq!(pick.step_id.as_deref(), Some("stepC"));
        assert_eq!(pick.blocked.len(), 1);
    }

    #[test]
    fn smallest_id_wins_and_other_types_are_ignored() {
        let run = flow_run(json!({
            "charts:4h": {"stepType": "CHART_EXPORT", "status": "READY"},
            "charts:1h": {"stepType": "CHART_EXPORT", "status": "READY"},
            "a-llm": {"stepType": "LLM_REPORT", "status": "READY"},
            "charts:0": {"stepType": "CHART_EXPORT", "status": "RUNNING"}
        }));

        assert_eq!(pick_ready_chart_export_step(&run).step_id.as_deref(), Some("charts:1h"));
    }

    #[test]
    fn missing_dependency_is_reported_without_status() {
        let run = flow_run(json!({
            "stepA": {"stepType": "CHART_EXPORT", "status": "READY", "dependsOn": ["ghost"]}
        }));

        let unmet = unmet_dependencies(&run, run.step("stepA").unwrap());
        assert_eq!(
            unmet,
            vec![UnmetDependency {
                step_id: "ghost".into(),
                status: None,
            }]
        );
    }
}
