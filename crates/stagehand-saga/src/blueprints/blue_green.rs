//! Blue/green deploy
//!
//! build image → (optional) generate and sync release flag → apply
//! manifests → make the new build the task queue default → wait, best
//! effort, for the previous build to drain.
//!
//! Unwind order on failure is rollout-restart, then flag rollback. A pushed
//! image cannot be unpushed, so the build step has no compensation.

use crate::blueprint::Blueprint;
use crate::error::SagaError;
use crate::saga::{Compensation, Saga};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

/// Capability ids used by the blue/green blueprint
pub mod caps {
    /// Build an image and push it to the registry
    pub const BUILD_AND_PUSH: &str = "container.build_and_push";
    /// Create the release flag for a build
    pub const GENERATE_RELEASE_FLAG: &str = "flags.generate_release_flag";
    /// Push flag definitions to the flag service
    pub const SYNC_FLAGS: &str = "flags.sync";
    /// Remove a release flag
    pub const ROLLBACK_FLAG: &str = "flags.rollback";
    /// Apply Kubernetes manifests
    pub const APPLY_MANIFESTS: &str = "k8s.apply_manifests";
    /// Restart workloads onto their previous revision
    pub const ROLLOUT_RESTART: &str = "k8s.rollout_restart";
    /// Make a build id the default of a task queue
    pub const SET_DEFAULT_BUILD: &str = "worker.set_default_build_id";
    /// Report whether a build id still has in-flight work
    pub const DRAIN_STATUS: &str = "worker.drain_status";
}

/// Release flag to create alongside the deploy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseFlagSpec {
    /// Flag key
    pub key: String,
    /// Human description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Blue/green deploy input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlueGreenInput {
    /// Application name
    pub app: String,
    /// Image repository, e.g. `registry.example.com/shop/api`
    pub image_repository: String,
    /// Build id; also the image tag
    pub build_id: String,
    /// Build context directory
    #[serde(default = "default_context_dir")]
    pub context_dir: String,
    /// Target namespace
    pub namespace: String,
    /// Manifest paths
    pub manifests: Vec<String>,
    /// Worker task queue
    pub task_queue: String,
    /// Build id to drain, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_build_id: Option<String>,
    /// Release flag to create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_flag: Option<ReleaseFlagSpec>,
    /// Upper bound on the drain wait
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_timeout_seconds: Option<u64>,
    /// Interval between drain polls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_poll_interval_seconds: Option<u64>,
}

fn default_context_dir() -> String {
    ".".to_string()
}

/// Release flag sync result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlagSyncStatus {
    /// Flag created and synced
    Synced,
    /// No flag requested
    Skipped,
}

/// How the drain wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DrainStatus {
    /// Previous build has no in-flight work
    Drained,
    /// Gave up waiting; not an error
    Timeout,
    /// No previous build to drain
    Skipped,
    /// Drain status could not be read; not an error
    Failed,
}

/// Blue/green deploy result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueGreenOutput {
    /// Always `true` for a completed run
    pub success: bool,
    /// Pushed image reference
    pub image_ref: String,
    /// Image digest, when the registry reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Deployed build id
    pub build_id: String,
    /// Resources created or changed by the apply
    pub resources_affected: Vec<String>,
    /// Release flag outcome
    pub flag_sync_status: FlagSyncStatus,
    /// Drain outcome
    pub drain_status: DrainStatus,
    /// Summary
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildOutput {
    image_ref: String,
    #[serde(default)]
    digest: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlagOutput {
    flag_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplyOutput {
    #[serde(default)]
    resources_affected: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DrainOutput {
    drained: bool,
}

/// Blue/green deploy blueprint
#[derive(Debug, Clone, Copy, Default)]
pub struct BlueGreenDeploy;

impl BlueGreenDeploy {
    async fn release_flag(
        saga: &mut Saga,
        input: &BlueGreenInput,
    ) -> Result<FlagSyncStatus, SagaError> {
        let Some(flag) = &input.release_flag else {
            return Ok(FlagSyncStatus::Skipped);
        };
        let generated: FlagOutput = saga
            .execute_as(
                caps::GENERATE_RELEASE_FLAG,
                json!({
                    "app": input.app,
                    "key": flag.key,
                    "description": flag.description,
                    "buildId": input.build_id,
                }),
            )
            .await?;
        saga.execute_by_id(
            caps::SYNC_FLAGS,
            json!({ "app": input.app, "flagKey": generated.flag_key }),
        )
        .await?;
        saga.add_compensation(Compensation::invoke(
            "rollback release flag",
            caps::ROLLBACK_FLAG,
            json!({ "app": input.app, "flagKey": generated.flag_key }),
        ))?;
        Ok(FlagSyncStatus::Synced)
    }

    /// Poll until the previous build drains or the bound is reached
    async fn drain(saga: &mut Saga, input: &BlueGreenInput) -> Result<DrainStatus, SagaError> {
        let Some(previous) = &input.previous_build_id else {
            return Ok(DrainStatus::Skipped);
        };
        let timeout = Duration::from_secs(
            input
                .drain_timeout_seconds
                .unwrap_or(saga.config().drain_timeout_secs),
        );
        let poll = Duration::from_secs(
            input
                .drain_poll_interval_seconds
                .unwrap_or(saga.config().drain_poll_interval_secs)
                .max(1),
        );
        let mut waited = Duration::ZERO;

        loop {
            let status = saga
                .execute_as::<DrainOutput>(
                    caps::DRAIN_STATUS,
                    json!({ "taskQueue": input.task_queue, "buildId": previous }),
                )
                .await;
            match status {
                Ok(DrainOutput { drained: true }) => return Ok(DrainStatus::Drained),
                Ok(_) => {}
                Err(e @ SagaError::Capability { .. }) if !e.is_cancelled() => {
                    tracing::warn!(run_id = %saga.run_id(), build_id = %previous, error = %e, "drain status unavailable");
                    return Ok(DrainStatus::Failed);
                }
                Err(e) => return Err(e),
            }

            if waited >= timeout {
                tracing::warn!(
                    run_id = %saga.run_id(),
                    build_id = %previous,
                    waited_secs = waited.as_secs(),
                    "drain timed out, continuing"
                );
                return Ok(DrainStatus::Timeout);
            }
            let step = poll.min(timeout - waited);
            saga.sleep(step).await?;
            waited += step;
        }
    }
}

#[async_trait]
impl Blueprint for BlueGreenDeploy {
    type Input = BlueGreenInput;
    type Output = BlueGreenOutput;

    fn id(&self) -> &'static str {
        "deploy.blue_green"
    }

    async fn run(&self, saga: &mut Saga, input: BlueGreenInput) -> Result<BlueGreenOutput, SagaError> {
        let build: BuildOutput = saga
            .execute_as(
                caps::BUILD_AND_PUSH,
                json!({
                    "repository": input.image_repository,
                    "tag": input.build_id,
                    "contextDir": input.context_dir,
                }),
            )
            .await?;
        tracing::warn!(
            run_id = %saga.run_id(),
            image_ref = %build.image_ref,
            "pushed image has no compensation; it stays in the registry if the deploy unwinds"
        );

        let flag_sync_status = Self::release_flag(saga, &input).await?;

        let applied: ApplyOutput = saga
            .execute_as(
                caps::APPLY_MANIFESTS,
                json!({
                    "namespace": input.namespace,
                    "manifests": input.manifests,
                    "imageRef": build.image_ref,
                }),
            )
            .await?;
        saga.add_compensation(Compensation::invoke(
            "rollout restart",
            caps::ROLLOUT_RESTART,
            json!({
                "namespace": input.namespace,
                "resources": applied.resources_affected,
            }),
        ))?;

        saga.execute_by_id(
            caps::SET_DEFAULT_BUILD,
            json!({ "taskQueue": input.task_queue, "buildId": input.build_id }),
        )
        .await?;

        let drain_status = Self::drain(saga, &input).await?;

        let message = format!(
            "build {} deployed to {} ({} resources); drain {}",
            input.build_id,
            input.namespace,
            applied.resources_affected.len(),
            match drain_status {
                DrainStatus::Drained => "completed",
                DrainStatus::Timeout => "timed out",
                DrainStatus::Skipped => "skipped",
                DrainStatus::Failed => "status unavailable",
            }
        );
        Ok(BlueGreenOutput {
            success: true,
            image_ref: build.image_ref,
            digest: build.digest,
            build_id: input.build_id,
            resources_affected: applied.resources_affected,
            flag_sync_status,
            drain_status,
            message,
        })
    }
}
