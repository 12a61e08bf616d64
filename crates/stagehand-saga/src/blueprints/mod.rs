//! Built-in blueprints

pub mod blue_green;
pub mod rollout;

pub use blue_green::{BlueGreenDeploy, BlueGreenInput, BlueGreenOutput, DrainStatus, FlagSyncStatus};
pub use rollout::{
    decide, Analysis, Decision, MetricDeltas, MetricThresholds, MetricsSnapshot,
    ProgressiveRollout, RolloutInput, RolloutOutput, RolloutStage, RolloutStatus,
};
