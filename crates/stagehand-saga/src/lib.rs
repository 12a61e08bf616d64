//! Stagehand saga orchestration
//!
//! Sequences capability calls into blueprints with compensation on failure
//! and durable, replay-safe sleeps.
//!
//! # Core Concepts
//!
//! - [`Orchestrator`]: drives blueprint runs against an injected registry and substrate
//! - [`Saga`]: per-run handle with `execute_by_id`, `add_compensation` and `sleep`
//! - [`Substrate`]: journal and durable timers; [`InMemorySubstrate`] for tests and the CLI
//! - [`blueprints`]: blue/green deploy and progressive rollout
//! - [`ToolSurface`]: schema-gated call surface over capabilities and blueprints
//!
//! # Example
//!
//! ```rust,ignore
//! use stagehand_saga::prelude::*;
//!
//! let orchestrator = Orchestrator::new(config, registry, substrate, secrets);
//! let report = orchestrator
//!     .start(&ProgressiveRollout, input, RunOptions::new(context))
//!     .await?;
//! assert_eq!(report.output.status, RolloutStatus::Promoted);
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod blueprint;
pub mod blueprints;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod saga;
pub mod substrate;
pub mod tool;

pub use blueprint::{Blueprint, BlueprintRegistry, DynBlueprint};
pub use config::{ConfigError, OrchestratorConfig, CONFIG_ENV};
pub use error::{SagaError, SagaFailure, SubstrateError};
pub use orchestrator::{Orchestrator, RunOptions, RunReport};
pub use saga::{
    allowed_transitions, validate_transition, Compensation, CompensationAction,
    CompensationRecord, RunHistory, Saga, SagaStatus, StepRecord,
};
pub use substrate::{
    CompensationOutcome, InMemorySubstrate, JournalEntry, JournalRecord, RunHandle, RunId,
    RunSnapshot, RunStatus, SleepOutcome, StepOutcome, Substrate, TimerKey, TimerScope,
};
pub use tool::{ToolEnvelope, ToolError, ToolInfo, ToolKind, ToolSurface};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commonly used types
pub mod prelude {
    pub use crate::blueprint::{Blueprint, BlueprintRegistry};
    pub use crate::blueprints::{
        BlueGreenDeploy, BlueGreenInput, DrainStatus, ProgressiveRollout, RolloutInput,
        RolloutStatus,
    };
    pub use crate::config::OrchestratorConfig;
    pub use crate::error::{SagaError, SagaFailure};
    pub use crate::orchestrator::{Orchestrator, RunOptions, RunReport};
    pub use crate::saga::{Compensation, Saga, SagaStatus};
    pub use crate::substrate::{InMemorySubstrate, RunId, Substrate};
    pub use crate::tool::{ToolEnvelope, ToolSurface};
}
