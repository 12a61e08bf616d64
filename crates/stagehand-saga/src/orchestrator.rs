//! Saga orchestrator
//!
//! Owns the injected capability registry, the sandbox runtime and the
//! durable substrate, and drives blueprint runs against them. On an
//! unhandled forward error (or cancellation) the run unwinds its
//! compensations and the caller receives the original error together with
//! the run history.

use crate::blueprint::Blueprint;
use crate::config::OrchestratorConfig;
use crate::error::{SagaError, SagaFailure};
use crate::saga::{RunHistory, Saga, SagaStatus};
use crate::substrate::{RunId, RunStatus, Substrate};
use serde_json::Value;
use stagehand_capability::{
    CapabilityRegistry, ExecutionContext, ExecutionRuntime, RegisteredCapability, SecretStore,
    ValidatedInvocation,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared state of every run driven by one orchestrator
pub(crate) struct Engine {
    pub(crate) registry: Arc<CapabilityRegistry>,
    pub(crate) runtime: ExecutionRuntime,
    pub(crate) substrate: Arc<dyn Substrate>,
    pub(crate) config: OrchestratorConfig,
}

/// Per-run options
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Caller context propagated to every invocation
    pub context: ExecutionContext,
    /// Cancellation observed between steps and during sleeps
    pub cancel: CancellationToken,
}

impl RunOptions {
    /// Options with a fresh cancellation token
    #[must_use]
    pub fn new(context: ExecutionContext) -> Self {
        Self {
            context,
            cancel: CancellationToken::new(),
        }
    }

    /// With an external cancellation token
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Successful run
#[derive(Debug, Clone)]
pub struct RunReport<T> {
    /// Run id
    pub run_id: RunId,
    /// Blueprint output
    pub output: T,
    /// Steps taken (and replayed)
    pub history: RunHistory,
}

/// Blueprint-agnostic saga driver
#[derive(Clone)]
pub struct Orchestrator {
    engine: Arc<Engine>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("capabilities", &self.engine.registry.len())
            .field("config", &self.engine.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Create an orchestrator over an immutable registry
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<CapabilityRegistry>,
        substrate: Arc<dyn Substrate>,
        secret_store: Arc<dyn SecretStore>,
    ) -> Self {
        let runtime = ExecutionRuntime::new(secret_store, config.secret_mount_root.clone())
            .with_default_timeout(config.execution_timeout());
        Self {
            engine: Arc::new(Engine {
                registry,
                runtime,
                substrate,
                config,
            }),
        }
    }

    /// Configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.engine.config
    }

    /// Capability registry
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &CapabilityRegistry {
        &self.engine.registry
    }

    /// Durable substrate
    #[inline]
    #[must_use]
    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.engine.substrate
    }

    /// Start a new run of `blueprint`
    ///
    /// # Errors
    /// [`SagaFailure`] carrying the original error and the run history.
    pub async fn start<B: Blueprint>(
        &self,
        blueprint: &B,
        input: B::Input,
        options: RunOptions,
    ) -> Result<RunReport<B::Output>, SagaFailure> {
        let stored = serde_json::to_value(&input)
            .map_err(|e| SagaFailure::before_start(SagaError::InvalidInput(e.to_string())))?;
        let handle = self
            .engine
            .substrate
            .start_run(blueprint.id(), stored)
            .await
            .map_err(|e| SagaFailure::before_start(e.into()))?;
        self.drive(blueprint, handle.run_id, input, Vec::new(), options)
            .await
    }

    /// Re-drive a stored run
    ///
    /// Effects already journaled are replayed, not re-executed; an
    /// interrupted sleep waits only for its remaining time.
    ///
    /// # Errors
    /// [`SagaFailure`] if the run is unknown, belongs to another blueprint,
    /// or fails.
    pub async fn resume<B: Blueprint>(
        &self,
        blueprint: &B,
        run_id: RunId,
        options: RunOptions,
    ) -> Result<RunReport<B::Output>, SagaFailure> {
        let snapshot = self
            .engine
            .substrate
            .load_run(run_id)
            .await
            .map_err(|e| SagaFailure::before_start(e.into()))?;
        if snapshot.blueprint_id != blueprint.id() {
            return Err(SagaFailure::before_start(SagaError::InvalidInput(format!(
                "run {run_id} belongs to blueprint `{}`",
                snapshot.blueprint_id
            ))));
        }
        let input: B::Input = serde_json::from_value(snapshot.input)
            .map_err(|e| SagaFailure::before_start(SagaError::InvalidInput(e.to_string())))?;
        tracing::info!(run_id = %run_id, replayable = snapshot.journal.len(), "resuming run");
        self.drive(blueprint, run_id, input, snapshot.journal, options)
            .await
    }

    async fn drive<B: Blueprint>(
        &self,
        blueprint: &B,
        run_id: RunId,
        input: B::Input,
        journal: Vec<crate::substrate::JournalEntry>,
        options: RunOptions,
    ) -> Result<RunReport<B::Output>, SagaFailure> {
        let trace_id = options.context.trace_id.clone();
        let mut saga = Saga::new(
            Arc::clone(&self.engine),
            run_id,
            options.context,
            options.cancel,
            journal,
        );
        tracing::info!(run_id = %run_id, blueprint = blueprint.id(), trace_id = %trace_id, "run started");

        let error = match blueprint.run(&mut saga, input).await {
            Ok(output) => match saga.transition(SagaStatus::Completed) {
                Ok(()) => {
                    self.finish(run_id, RunStatus::Completed).await;
                    tracing::info!(run_id = %run_id, blueprint = blueprint.id(), "run completed");
                    return Ok(RunReport {
                        run_id,
                        output,
                        history: saga.into_history(),
                    });
                }
                Err(e) => e,
            },
            Err(e) => e,
        };

        tracing::error!(
            run_id = %run_id,
            blueprint = blueprint.id(),
            trace_id = %trace_id,
            error = %error,
            "run failed, compensating"
        );
        saga.unwind().await;
        self.finish(run_id, RunStatus::Failed).await;
        Err(SagaFailure {
            run_id: Some(run_id),
            error,
            history: saga.into_history(),
        })
    }

    async fn finish(&self, run_id: RunId, status: RunStatus) {
        if let Err(e) = self.engine.substrate.finish_run(run_id, status).await {
            tracing::warn!(run_id = %run_id, error = %e, "run status not persisted");
        }
    }

    /// Invoke one capability outside any blueprint
    ///
    /// # Errors
    /// [`SagaFailure`] with the capability error.
    pub async fn execute_by_id(
        &self,
        cap_id: &str,
        args: Value,
        options: RunOptions,
    ) -> Result<Value, SagaFailure> {
        let (capability, validated) = self
            .engine
            .validate(cap_id, args, &options.context)
            .map_err(|e| SagaFailure::before_start(SagaError::capability(cap_id, e)))?;
        self.execute_validated(capability, validated, options.cancel)
            .await
    }

    /// Invoke an already validated capability as a single-step run
    ///
    /// Retry waits go through the durable substrate like any other step. The
    /// run is retired once it finishes unless
    /// [`OrchestratorConfig::retain_single_step_runs`] is set.
    ///
    /// # Errors
    /// [`SagaFailure`] with the capability error.
    pub async fn execute_validated(
        &self,
        capability: &RegisteredCapability,
        validated: ValidatedInvocation,
        cancel: CancellationToken,
    ) -> Result<Value, SagaFailure> {
        let cap_id = capability.descriptor().id();
        let handle = self
            .engine
            .substrate
            .start_run(&format!("capability/{cap_id}"), validated.args().clone())
            .await
            .map_err(|e| SagaFailure::before_start(e.into()))?;
        let mut saga = Saga::new(
            Arc::clone(&self.engine),
            handle.run_id,
            validated.context().clone(),
            cancel,
            Vec::new(),
        );

        let result = match saga.execute_validated(capability, &validated).await {
            Ok(output) => saga.transition(SagaStatus::Completed).map(|()| output),
            Err(error) => Err(error),
        };
        let outcome = match result {
            Ok(output) => {
                self.finish(handle.run_id, RunStatus::Completed).await;
                Ok(output)
            }
            Err(error) => {
                saga.unwind().await;
                self.finish(handle.run_id, RunStatus::Failed).await;
                Err(SagaFailure {
                    run_id: Some(handle.run_id),
                    error,
                    history: saga.into_history(),
                })
            }
        };

        if !self.engine.config.retain_single_step_runs {
            if let Err(e) = self.engine.substrate.retire_run(handle.run_id).await {
                tracing::warn!(run_id = %handle.run_id, error = %e, "single-step run not retired");
            }
        }
        outcome
    }
}
