//! Progressive rollout blueprint end to end against scripted metrics

mod common;

use common::{failing, harness, options, register, returning};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use stagehand_capability::{CapabilityRegistry, HandlerError};
use stagehand_saga::blueprints::rollout::{caps, MeshRouting};
use stagehand_saga::blueprints::{
    Decision, ProgressiveRollout, RolloutInput, RolloutOutput, RolloutStatus,
};
use stagehand_saga::SagaError;
use stagehand_test_utils::{CallLog, ScriptedHandler};
use std::sync::atomic::Ordering;
use std::time::Duration;

const STAGES: [u8; 5] = [10, 25, 50, 75, 100];

fn input(mesh: bool) -> RolloutInput {
    RolloutInput {
        version: "v2".into(),
        baseline_version: "v1".into(),
        flag_key: "checkout-v2".into(),
        stages: STAGES.to_vec(),
        analysis_window_seconds: Some(120),
        error_rate_threshold: 0.05,
        max_latency_delta_ms: None,
        mesh: mesh.then(|| MeshRouting {
            service: "checkout".into(),
            stable_subset: "v1".into(),
            canary_subset: "v2".into(),
        }),
    }
}

fn healthy() -> Value {
    json!({
        "baseline": { "errorRate": 0.01, "p95LatencyMs": 120.0, "requestCount": 900 },
        "canary": { "errorRate": 0.012, "p95LatencyMs": 125.0, "requestCount": 100 }
    })
}

fn breached() -> Value {
    json!({
        "baseline": { "errorRate": 0.01, "p95LatencyMs": 120.0, "requestCount": 900 },
        "canary": { "errorRate": 0.2, "p95LatencyMs": 130.0, "requestCount": 100 }
    })
}

/// Flag and mesh capabilities logging to `log`, metrics answering `metrics` in order
fn registry(log: &CallLog, metrics: Vec<Result<Value, HandlerError>>) -> (CapabilityRegistry, ScriptedHandler) {
    let mut registry = CapabilityRegistry::new();
    for id in [caps::SET_PERCENTAGE, caps::DISABLE_FLAG, caps::SET_MESH_WEIGHTS] {
        returning(&mut registry, log, id, json!({}));
    }
    (registry, ScriptedHandler::new(metrics).with_fallback(healthy()))
}

fn percentages(log: &CallLog) -> Vec<u64> {
    log.inputs(caps::SET_PERCENTAGE)
        .iter()
        .map(|input| input["percentage"].as_u64().unwrap())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn healthy_stages_promote_to_full_traffic() {
    let log = CallLog::new();
    let (mut registry, metrics) = registry(&log, vec![]);
    let compared = metrics.counter();
    register(&mut registry, caps::COMPARE_METRICS, metrics);
    let h = harness(registry);

    let report = h
        .orchestrator
        .start(&ProgressiveRollout, input(false), options())
        .await
        .unwrap();

    let output = report.output;
    assert_eq!(output.status, RolloutStatus::Promoted);
    assert_eq!(output.final_percentage, 100);
    assert_eq!(output.stopped_at_percentage, None);
    let visited: Vec<u8> = output.stage_results.iter().map(|s| s.percentage).collect();
    assert_eq!(visited, STAGES);
    let decisions: Vec<Decision> = output.stage_results.iter().map(|s| s.decision).collect();
    assert_eq!(
        decisions,
        [
            Decision::Continue,
            Decision::Continue,
            Decision::Continue,
            Decision::Continue,
            Decision::Promote
        ]
    );

    assert_eq!(percentages(&log), [10, 25, 50, 75, 100, 100]);
    assert_eq!(compared.load(Ordering::SeqCst), 5);
    assert_eq!(
        h.substrate.sleeps(report.run_id),
        vec![Duration::from_secs(120); 5]
    );
    assert_eq!(log.count(caps::DISABLE_FLAG), 0);
}

#[tokio::test(start_paused = true)]
async fn breach_at_fifty_rolls_back_and_keeps_partial_log() {
    let log = CallLog::new();
    let (mut registry, metrics) = registry(&log, vec![Ok(healthy()), Ok(healthy()), Ok(breached())]);
    register(&mut registry, caps::COMPARE_METRICS, metrics);
    let h = harness(registry);

    let output = h
        .orchestrator
        .start(&ProgressiveRollout, input(false), options())
        .await
        .unwrap()
        .output;

    assert_eq!(output.status, RolloutStatus::RolledBack);
    assert_eq!(output.stopped_at_percentage, Some(50));
    assert_eq!(output.final_percentage, 0);
    let visited: Vec<u8> = output.stage_results.iter().map(|s| s.percentage).collect();
    assert_eq!(visited, [10, 25, 50]);
    assert_eq!(output.stage_results[2].decision, Decision::Rollback);
    assert!(output.reason.unwrap().contains("error rate"));

    assert_eq!(percentages(&log), [10, 25, 50]);
    assert_eq!(
        log.inputs(caps::DISABLE_FLAG),
        vec![json!({ "flagKey": "checkout-v2" })]
    );
}

#[tokio::test(start_paused = true)]
async fn mesh_follows_the_stages_and_resets_on_rollback() {
    let log = CallLog::new();
    let (mut registry, metrics) = registry(&log, vec![Ok(healthy()), Ok(breached())]);
    register(&mut registry, caps::COMPARE_METRICS, metrics);
    let h = harness(registry);

    let output = h
        .orchestrator
        .start(&ProgressiveRollout, input(true), options())
        .await
        .unwrap()
        .output;

    assert_eq!(output.status, RolloutStatus::RolledBack);
    let weights: Vec<(u64, u64)> = log
        .inputs(caps::SET_MESH_WEIGHTS)
        .iter()
        .map(|w| {
            (
                w["stableWeight"].as_u64().unwrap(),
                w["canaryWeight"].as_u64().unwrap(),
            )
        })
        .collect();
    assert_eq!(weights, [(90, 10), (75, 25), (100, 0)]);
}

#[tokio::test(start_paused = true)]
async fn promotion_moves_mesh_to_the_canary() {
    let log = CallLog::new();
    let (mut registry, metrics) = registry(&log, vec![]);
    register(&mut registry, caps::COMPARE_METRICS, metrics);
    let h = harness(registry);
    let mut input = input(true);
    input.stages = vec![50];

    h.orchestrator
        .start(&ProgressiveRollout, input, options())
        .await
        .unwrap();

    let last = log.inputs(caps::SET_MESH_WEIGHTS).pop().unwrap();
    assert_eq!(last["canaryWeight"], 100);
    assert_eq!(last["stableWeight"], 0);
}

#[tokio::test(start_paused = true)]
async fn metrics_failure_compensates_flag_and_mesh() {
    let log = CallLog::new();
    let (mut registry, _) = registry(&log, vec![]);
    failing(&mut registry, &log, caps::COMPARE_METRICS);
    let h = harness(registry);

    let failure = h
        .orchestrator
        .start(&ProgressiveRollout, input(true), options())
        .await
        .unwrap_err();

    assert!(matches!(
        &failure.error,
        SagaError::Capability { cap_id, .. } if cap_id == caps::COMPARE_METRICS
    ));
    let ids = log.ids();
    assert_eq!(&ids[ids.len() - 2..], [caps::SET_MESH_WEIGHTS, caps::DISABLE_FLAG]);
    assert_eq!(
        log.inputs(caps::SET_MESH_WEIGHTS).last().unwrap()["canaryWeight"],
        0
    );
}

#[tokio::test(start_paused = true)]
async fn failure_mid_rollout_reports_failed_with_completed_stages() {
    let log = CallLog::new();
    let (mut registry, metrics) = registry(
        &log,
        vec![
            Ok(healthy()),
            Ok(healthy()),
            Err(HandlerError::failed("permission denied")),
        ],
    );
    register(&mut registry, caps::COMPARE_METRICS, metrics);
    let h = harness(registry);

    let failure = h
        .orchestrator
        .start(&ProgressiveRollout, input(false), options())
        .await
        .unwrap_err();

    assert!(matches!(
        &failure.error,
        SagaError::Capability { cap_id, .. } if cap_id == caps::COMPARE_METRICS
    ));
    let partial = failure.history.partial_output.clone().unwrap();
    let output: RolloutOutput = serde_json::from_value(partial).unwrap();
    assert_eq!(output.status, RolloutStatus::Failed);
    assert_eq!(output.final_percentage, 0);
    assert_eq!(output.stopped_at_percentage, Some(50));
    let visited: Vec<u8> = output.stage_results.iter().map(|s| s.percentage).collect();
    assert_eq!(visited, [10, 25]);
    assert!(output
        .stage_results
        .iter()
        .all(|s| s.decision == Decision::Continue));
    assert!((output.stage_results[1].canary_metrics.error_rate - 0.012).abs() < f64::EPSILON);

    assert_eq!(percentages(&log), [10, 25, 50]);
    assert_eq!(log.ids().last().unwrap(), caps::DISABLE_FLAG);
}

#[tokio::test]
async fn invalid_input_fails_before_any_effect() {
    let log = CallLog::new();
    let (mut registry, metrics) = registry(&log, vec![]);
    register(&mut registry, caps::COMPARE_METRICS, metrics);
    let h = harness(registry);
    let mut input = input(false);
    input.stages = vec![10, 120];

    let failure = h
        .orchestrator
        .start(&ProgressiveRollout, input, options())
        .await
        .unwrap_err();

    assert!(matches!(failure.error, SagaError::InvalidInput(_)));
    assert!(log.is_empty());
}
