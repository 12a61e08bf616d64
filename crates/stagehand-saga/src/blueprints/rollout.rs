//! Progressive rollout and its decision engine
//!
//! Per stage: set flag percentage → (optional) set mesh weights → wait the
//! analysis window → compare baseline and canary metrics → decide.
//!
//! ```text
//! SET_PERCENTAGE ─► SET_MESH_WEIGHTS ─► SLEEP ─► ANALYZE ─┬─► CONTINUE ─► next stage
//!                                                         ├─► PROMOTE  ─► flag 100%, mesh to canary
//!                                                         └─► ROLLBACK ─► flag off, mesh 100/0
//! ```
//!
//! The decision itself is the pure function [`decide`]. Every analyzed stage
//! is appended to the stage log, including the one that rolled back. When a
//! capability call fails instead, the run unwinds and a FAILED
//! [`RolloutOutput`] carrying the partial stage log is attached to the run
//! history.

use crate::blueprint::Blueprint;
use crate::error::SagaError;
use crate::saga::{Compensation, Saga};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

/// Capability ids used by the rollout blueprint
pub mod caps {
    /// Set the rollout percentage of a flag
    pub const SET_PERCENTAGE: &str = "flags.set_percentage";
    /// Turn a flag off
    pub const DISABLE_FLAG: &str = "flags.disable";
    /// Set stable/canary routing weights
    pub const SET_MESH_WEIGHTS: &str = "mesh.set_weights";
    /// Compare baseline and canary metrics over a window
    pub const COMPARE_METRICS: &str = "metrics.compare";
}

/// Mesh routing for the canary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MeshRouting {
    /// Mesh service name
    pub service: String,
    /// Subset serving the baseline
    pub stable_subset: String,
    /// Subset serving the canary
    pub canary_subset: String,
}

/// Rollout input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RolloutInput {
    /// Canary version
    pub version: String,
    /// Version currently serving
    pub baseline_version: String,
    /// Release flag gating the canary
    pub flag_key: String,
    /// Percentages, visited in order
    pub stages: Vec<u8>,
    /// Wait before each analysis; orchestrator default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_window_seconds: Option<u64>,
    /// Highest tolerated canary error rate, `0.0..=1.0`
    pub error_rate_threshold: f64,
    /// Highest tolerated p95 latency increase over baseline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency_delta_ms: Option<f64>,
    /// Mesh routing, if traffic is also split at the mesh
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh: Option<MeshRouting>,
}

impl RolloutInput {
    /// Reject inputs no stage could be run with
    ///
    /// # Errors
    /// [`SagaError::InvalidInput`] naming the first problem.
    pub fn validate(&self) -> Result<(), SagaError> {
        if self.stages.is_empty() {
            return Err(SagaError::InvalidInput("stages must not be empty".into()));
        }
        if let Some(bad) = self.stages.iter().find(|p| **p > 100) {
            return Err(SagaError::InvalidInput(format!(
                "stage percentage {bad} is above 100"
            )));
        }
        if !(0.0..=1.0).contains(&self.error_rate_threshold) {
            return Err(SagaError::InvalidInput(format!(
                "errorRateThreshold {} is outside 0..=1",
                self.error_rate_threshold
            )));
        }
        if self.max_latency_delta_ms.is_some_and(|d| d.is_nan() || d < 0.0) {
            return Err(SagaError::InvalidInput(
                "maxLatencyDeltaMs must be non-negative".into(),
            ));
        }
        Ok(())
    }

    /// Thresholds the decision engine checks
    #[must_use]
    pub fn thresholds(&self) -> MetricThresholds {
        MetricThresholds {
            error_rate: self.error_rate_threshold,
            max_latency_delta_ms: self.max_latency_delta_ms,
        }
    }
}

/// Metrics of one version over the analysis window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Failed requests / total requests
    pub error_rate: f64,
    /// p95 latency
    pub p95_latency_ms: f64,
    /// Requests observed
    #[serde(default)]
    pub request_count: u64,
}

/// Canary minus baseline
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDeltas {
    /// Error rate difference
    pub error_rate: f64,
    /// p95 latency difference
    pub p95_latency_ms: f64,
}

impl MetricDeltas {
    /// Compute deltas
    #[must_use]
    pub fn between(baseline: &MetricsSnapshot, canary: &MetricsSnapshot) -> Self {
        Self {
            error_rate: canary.error_rate - baseline.error_rate,
            p95_latency_ms: canary.p95_latency_ms - baseline.p95_latency_ms,
        }
    }
}

/// Limits a stage must stay within
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricThresholds {
    /// Highest tolerated canary error rate
    pub error_rate: f64,
    /// Highest tolerated p95 latency increase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency_delta_ms: Option<f64>,
}

/// Stage verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    /// Last stage healthy
    Promote,
    /// Stop and revert
    Rollback,
    /// Healthy; go to the next stage
    Continue,
}

/// Result of analyzing one stage
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    /// Verdict
    pub decision: Decision,
    /// Canary minus baseline
    pub deltas: MetricDeltas,
    /// Why the stage rolled back
    pub reason: Option<String>,
}

/// Decide a stage from its metrics
///
/// ROLLBACK when the canary error rate exceeds the threshold or the p95
/// latency increase exceeds its limit; otherwise PROMOTE on the last stage and
/// CONTINUE before it.
#[must_use]
pub fn decide(
    baseline: &MetricsSnapshot,
    canary: &MetricsSnapshot,
    thresholds: &MetricThresholds,
    last_stage: bool,
) -> Analysis {
    let deltas = MetricDeltas::between(baseline, canary);

    let reason = if canary.error_rate > thresholds.error_rate {
        Some(format!(
            "canary error rate {:.4} exceeds threshold {:.4}",
            canary.error_rate, thresholds.error_rate
        ))
    } else {
        match thresholds.max_latency_delta_ms {
            Some(limit) if deltas.p95_latency_ms > limit => Some(format!(
                "canary p95 latency +{:.1}ms exceeds limit {limit:.1}ms",
                deltas.p95_latency_ms
            )),
            _ => None,
        }
    };

    let decision = match (&reason, last_stage) {
        (Some(_), _) => Decision::Rollback,
        (None, true) => Decision::Promote,
        (None, false) => Decision::Continue,
    };
    Analysis {
        decision,
        deltas,
        reason,
    }
}

/// One analyzed stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStage {
    /// Traffic percentage during the stage
    pub percentage: u8,
    /// Verdict
    pub decision: Decision,
    /// Baseline metrics
    pub baseline_metrics: MetricsSnapshot,
    /// Canary metrics
    pub canary_metrics: MetricsSnapshot,
    /// Canary minus baseline
    pub deltas: MetricDeltas,
}

/// How the rollout ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RolloutStatus {
    /// Canary at 100%
    Promoted,
    /// Canary reverted after a ROLLBACK decision
    RolledBack,
    /// A step failed; compensations reverted the canary
    Failed,
}

/// Rollout result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutOutput {
    /// Outcome
    pub status: RolloutStatus,
    /// Canary version
    pub version: String,
    /// Baseline version
    pub baseline_version: String,
    /// Canary percentage when the run ended
    pub final_percentage: u8,
    /// Stage that rolled back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at_percentage: Option<u8>,
    /// Analyzed stages, in order
    pub stage_results: Vec<RolloutStage>,
    /// Rollback or failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Summary
    pub message: String,
}

impl RolloutOutput {
    /// Operator-facing result for a run that failed and was compensated
    ///
    /// `stage_results` holds the stages analyzed before the failure;
    /// `stopped_at` is the stage in progress when it happened.
    #[must_use]
    pub fn failed(
        input: &RolloutInput,
        error: &SagaError,
        stage_results: Vec<RolloutStage>,
        stopped_at: Option<u8>,
    ) -> Self {
        let message = match stopped_at {
            Some(percentage) => format!(
                "rollout of {} failed at {percentage}% and was reverted",
                input.version
            ),
            None => format!("rollout of {} failed and was reverted", input.version),
        };
        Self {
            status: RolloutStatus::Failed,
            version: input.version.clone(),
            baseline_version: input.baseline_version.clone(),
            final_percentage: 0,
            stopped_at_percentage: stopped_at,
            stage_results,
            reason: Some(error.to_string()),
            message,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Comparison {
    baseline: MetricsSnapshot,
    canary: MetricsSnapshot,
}

/// Progressive rollout blueprint
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressiveRollout;

impl ProgressiveRollout {
    async fn set_mesh(
        saga: &mut Saga,
        mesh: &MeshRouting,
        canary_weight: u8,
    ) -> Result<(), SagaError> {
        saga.execute_by_id(caps::SET_MESH_WEIGHTS, mesh_args(mesh, canary_weight))
            .await
            .map(|_| ())
    }

    /// Revert after a ROLLBACK decision
    async fn roll_back(saga: &mut Saga, input: &RolloutInput) -> Result<(), SagaError> {
        saga.execute_by_id(caps::DISABLE_FLAG, json!({ "flagKey": input.flag_key }))
            .await?;
        if let Some(mesh) = &input.mesh {
            Self::set_mesh(saga, mesh, 0).await?;
        }
        Ok(())
    }

    async fn promote(saga: &mut Saga, input: &RolloutInput) -> Result<(), SagaError> {
        saga.execute_by_id(
            caps::SET_PERCENTAGE,
            json!({ "flagKey": input.flag_key, "percentage": 100 }),
        )
        .await?;
        if let Some(mesh) = &input.mesh {
            Self::set_mesh(saga, mesh, 100).await?;
        }
        Ok(())
    }

    /// Stage loop; `stage_results` and `current` survive an early return
    async fn run_stages(
        saga: &mut Saga,
        input: &RolloutInput,
        stage_results: &mut Vec<RolloutStage>,
        current: &mut Option<u8>,
    ) -> Result<RolloutOutput, SagaError> {
        let window = Duration::from_secs(
            input
                .analysis_window_seconds
                .unwrap_or(saga.config().analysis_window_secs),
        );
        let thresholds = input.thresholds();

        for (index, &percentage) in input.stages.iter().enumerate() {
            *current = Some(percentage);
            saga.execute_by_id(
                caps::SET_PERCENTAGE,
                json!({ "flagKey": input.flag_key, "percentage": percentage }),
            )
            .await?;
            if index == 0 {
                saga.add_compensation(Compensation::invoke(
                    "disable release flag",
                    caps::DISABLE_FLAG,
                    json!({ "flagKey": input.flag_key }),
                ))?;
            }

            if let Some(mesh) = &input.mesh {
                Self::set_mesh(saga, mesh, percentage).await?;
                if index == 0 {
                    saga.add_compensation(Compensation::invoke(
                        "reset mesh weights",
                        caps::SET_MESH_WEIGHTS,
                        mesh_args(mesh, 0),
                    ))?;
                }
            }

            saga.sleep(window).await?;

            let comparison: Comparison = saga
                .execute_as(
                    caps::COMPARE_METRICS,
                    json!({
                        "baselineVersion": input.baseline_version,
                        "canaryVersion": input.version,
                        "windowSeconds": window.as_secs(),
                    }),
                )
                .await?;
            let last_stage = index + 1 == input.stages.len();
            let analysis = decide(&comparison.baseline, &comparison.canary, &thresholds, last_stage);
            tracing::info!(
                run_id = %saga.run_id(),
                percentage,
                decision = ?analysis.decision,
                canary_error_rate = comparison.canary.error_rate,
                "stage analyzed"
            );
            stage_results.push(RolloutStage {
                percentage,
                decision: analysis.decision,
                baseline_metrics: comparison.baseline,
                canary_metrics: comparison.canary,
                deltas: analysis.deltas,
            });

            if analysis.decision == Decision::Rollback {
                let reason = analysis.reason.unwrap_or_else(|| "metrics breached".into());
                tracing::warn!(run_id = %saga.run_id(), percentage, reason = %reason, "rolling back");
                Self::roll_back(saga, input).await?;
                return Ok(RolloutOutput {
                    status: RolloutStatus::RolledBack,
                    version: input.version.clone(),
                    baseline_version: input.baseline_version.clone(),
                    final_percentage: 0,
                    stopped_at_percentage: Some(percentage),
                    stage_results: std::mem::take(stage_results),
                    message: format!(
                        "{} rolled back at {percentage}%: {reason}",
                        input.version
                    ),
                    reason: Some(reason),
                });
            }
        }

        Self::promote(saga, input).await?;
        Ok(RolloutOutput {
            status: RolloutStatus::Promoted,
            version: input.version.clone(),
            baseline_version: input.baseline_version.clone(),
            final_percentage: 100,
            stopped_at_percentage: None,
            message: format!(
                "{} promoted after {} stages",
                input.version,
                stage_results.len()
            ),
            stage_results: std::mem::take(stage_results),
            reason: None,
        })
    }
}

fn mesh_args(mesh: &MeshRouting, canary_weight: u8) -> serde_json::Value {
    json!({
        "service": mesh.service,
        "stableSubset": mesh.stable_subset,
        "canarySubset": mesh.canary_subset,
        "stableWeight": 100 - canary_weight,
        "canaryWeight": canary_weight,
    })
}

#[async_trait]
impl Blueprint for ProgressiveRollout {
    type Input = RolloutInput;
    type Output = RolloutOutput;

    fn id(&self) -> &'static str {
        "deploy.progressive_rollout"
    }

    async fn run(&self, saga: &mut Saga, input: RolloutInput) -> Result<RolloutOutput, SagaError> {
        input.validate()?;
        let mut stage_results = Vec::with_capacity(input.stages.len());
        let mut current = None;

        match Self::run_stages(saga, &input, &mut stage_results, &mut current).await {
            Ok(output) => Ok(output),
            Err(error) => {
                let failed = RolloutOutput::failed(&input, &error, stage_results, current);
                tracing::error!(
                    run_id = %saga.run_id(),
                    stopped_at = ?current,
                    stages_analyzed = failed.stage_results.len(),
                    error = %error,
                    "rollout failed"
                );
                saga.set_partial_output(&failed);
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snapshot(error_rate: f64, p95: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            error_rate,
            p95_latency_ms: p95,
            request_count: 1_000,
        }
    }

    fn input(stages: Vec<u8>, threshold: f64) -> RolloutInput {
        RolloutInput {
            version: "v2".into(),
            baseline_version: "v1".into(),
            flag_key: "checkout-v2".into(),
            stages,
            analysis_window_seconds: None,
            error_rate_threshold: threshold,
            max_latency_delta_ms: None,
            mesh: None,
        }
    }

    #[test]
    fn error_rate_above_threshold_rolls_back() {
        let thresholds = MetricThresholds {
            error_rate: 0.05,
            max_latency_delta_ms: None,
        };
        let analysis = decide(&snapshot(0.01, 100.0), &snapshot(0.08, 100.0), &thresholds, false);
        assert_eq!(analysis.decision, Decision::Rollback);
        assert!(analysis.reason.unwrap().contains("error rate"));
    }

    #[test]
    fn latency_delta_rolls_back() {
        let thresholds = MetricThresholds {
            error_rate: 0.05,
            max_latency_delta_ms: Some(50.0),
        };
        let analysis = decide(&snapshot(0.0, 100.0), &snapshot(0.0, 180.0), &thresholds, true);
        assert_eq!(analysis.decision, Decision::Rollback);
        assert!((analysis.deltas.p95_latency_ms - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn healthy_stages_continue_until_last() {
        let thresholds = MetricThresholds {
            error_rate: 0.05,
            max_latency_delta_ms: None,
        };
        let healthy = snapshot(0.01, 100.0);
        assert_eq!(decide(&healthy, &healthy, &thresholds, false).decision, Decision::Continue);
        assert_eq!(decide(&healthy, &healthy, &thresholds, true).decision, Decision::Promote);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        assert!(input(vec![], 0.05).validate().is_err());
        assert!(input(vec![10, 101], 0.05).validate().is_err());
        assert!(input(vec![10], 1.5).validate().is_err());
        assert!(input(vec![10, 50, 100], 0.05).validate().is_ok());
    }

    #[test]
    fn output_uses_wire_shape() {
        let output =
            RolloutOutput::failed(&input(vec![10], 0.05), &SagaError::Cancelled, Vec::new(), None);
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["status"], "FAILED");
        assert_eq!(value["finalPercentage"], 0);
        assert_eq!(value["stageResults"], json!([]));
        assert!(value.get("stoppedAtPercentage").is_none());
    }

    proptest! {
        #[test]
        fn breach_always_rolls_back(
            threshold in 0.0f64..1.0,
            excess in 0.0001f64..1.0,
            last in any::<bool>(),
        ) {
            let thresholds = MetricThresholds { error_rate: threshold, max_latency_delta_ms: None };
            let canary = snapshot(threshold + excess, 100.0);
            let analysis = decide(&snapshot(0.0, 100.0), &canary, &thresholds, last);
            prop_assert_eq!(analysis.decision, Decision::Rollback);
        }

        #[test]
        fn within_limits_never_rolls_back(
            threshold in 0.0f64..=1.0,
            fraction in 0.0f64..=1.0,
            last in any::<bool>(),
        ) {
            let thresholds = MetricThresholds { error_rate: threshold, max_latency_delta_ms: Some(10.0) };
            let canary = snapshot(threshold * fraction, 105.0);
            let analysis = decide(&snapshot(0.0, 100.0), &canary, &thresholds, last);
            let expected = if last { Decision::Promote } else { Decision::Continue };
            prop_assert_eq!(analysis.decision, expected);
            prop_assert!(analysis.reason.is_none());
        }
    }
}
