//! Saga run state machine
//!
//! A [`Saga`] is the handle a blueprint drives. It sequences capability
//! invocations, owns the LIFO compensation stack and exposes the durable
//! sleep primitive. Every effect gets a sequence number and its outcome is
//! journaled, so re-driving a run replays recorded outcomes instead of
//! repeating side effects.
//!
//! ```text
//! RUNNING ──► COMPLETED
//!    │
//!    └──► COMPENSATING ──► FAILED
//! ```

use crate::error::SagaError;
use crate::orchestrator::Engine;
use crate::substrate::{
    CompensationOutcome, JournalEntry, JournalRecord, RunId, SleepOutcome, StepOutcome,
    Substrate, TimerKey, TimerScope,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagehand_capability::{
    execute_with_retry, CapabilityError, CapabilityInvocation, DurableSleep, ErrorKind,
    ExecutionContext, RegisteredCapability, ValidatedInvocation,
};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Saga run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    /// Forward phase in progress
    #[default]
    Running,
    /// Unwinding compensations
    Compensating,
    /// Forward phase finished
    Completed,
    /// Unwound after an error
    Failed,
}

/// Statuses reachable from `from`
#[must_use]
pub fn allowed_transitions(from: SagaStatus) -> &'static [SagaStatus] {
    use SagaStatus::{Compensating, Completed, Failed, Running};
    match from {
        Running => &[Completed, Compensating],
        Compensating => &[Failed],
        Completed | Failed => &[],
    }
}

/// Validate a status transition
///
/// # Errors
/// [`SagaError::InvalidState`] for anything outside [`allowed_transitions`].
pub fn validate_transition(from: SagaStatus, to: SagaStatus) -> Result<(), SagaError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(SagaError::InvalidState { from, to })
    }
}

/// Deferred undo action run during unwind
pub type InlineAction =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// How a compensation undoes its forward step
pub enum CompensationAction {
    /// Invoke a capability
    Invoke {
        /// Capability id
        cap_id: String,
        /// Arguments
        args: Value,
    },
    /// Run an inline action
    Inline(InlineAction),
}

impl fmt::Debug for CompensationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invoke { cap_id, args } => f
                .debug_struct("Invoke")
                .field("cap_id", cap_id)
                .field("args", args)
                .finish(),
            Self::Inline(_) => f.write_str("Inline(..)"),
        }
    }
}

/// Idempotent undo step, pushed right after the step it reverses succeeds
#[derive(Debug)]
pub struct Compensation {
    name: String,
    action: CompensationAction,
}

impl Compensation {
    /// Undo by invoking a capability
    #[must_use]
    pub fn invoke(name: impl Into<String>, cap_id: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            action: CompensationAction::Invoke {
                cap_id: cap_id.into(),
                args,
            },
        }
    }

    /// Undo with an inline action
    pub fn inline<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: CompensationAction::Inline(Box::new(
                move || -> BoxFuture<'static, Result<(), String>> { Box::pin(action()) },
            )),
        }
    }

    /// Compensation name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A forward step as seen in the run history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    /// Journal position
    pub seq: u64,
    /// Capability id
    pub cap_id: String,
    /// Whether the outcome came from the journal
    pub replayed: bool,
    /// Error kind, if the step failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

/// A compensation as seen in the run history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationRecord {
    /// Compensation name
    pub name: String,
    /// Outcome
    pub outcome: CompensationOutcome,
    /// Whether the outcome came from the journal
    pub replayed: bool,
}

/// Audit trail attached to every run result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunHistory {
    /// Run id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    /// Final status
    pub status: SagaStatus,
    /// Forward steps in order
    pub steps: Vec<StepRecord>,
    /// Compensations in the order they ran
    pub compensations: Vec<CompensationRecord>,
    /// Result the blueprint reported before a failed run unwound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_output: Option<Value>,
}

/// Durable sleep between retry attempts of one step
struct JournaledSleep<'a> {
    substrate: &'a dyn Substrate,
    run_id: RunId,
    scope: TimerScope,
    seq: u64,
    cap_id: &'a str,
    cancel: &'a CancellationToken,
}

#[async_trait]
impl DurableSleep for JournaledSleep<'_> {
    async fn sleep(&self, attempt: u32, duration: Duration) -> Result<(), CapabilityError> {
        let key = TimerKey {
            scope: self.scope,
            seq: self.seq,
            attempt,
        };
        match self
            .substrate
            .durable_sleep(self.run_id, key, duration, self.cancel)
            .await
        {
            Ok(SleepOutcome::Elapsed) => Ok(()),
            Ok(SleepOutcome::Cancelled) => Err(CapabilityError::cancelled(self.cap_id)),
            Err(e) => Err(CapabilityError::runner(format!("durable timer failed: {e}"))),
        }
    }
}

/// Handle a blueprint uses to drive one run
pub struct Saga {
    engine: Arc<Engine>,
    run_id: RunId,
    context: ExecutionContext,
    cancel: CancellationToken,
    journal: Vec<JournalEntry>,
    next_seq: u64,
    status: SagaStatus,
    compensations: Vec<Compensation>,
    history: RunHistory,
}

impl fmt::Debug for Saga {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Saga")
            .field("run_id", &self.run_id)
            .field("status", &self.status)
            .field("next_seq", &self.next_seq)
            .field("compensations", &self.compensations.len())
            .finish_non_exhaustive()
    }
}

impl Saga {
    pub(crate) fn new(
        engine: Arc<Engine>,
        run_id: RunId,
        context: ExecutionContext,
        cancel: CancellationToken,
        journal: Vec<JournalEntry>,
    ) -> Self {
        Self {
            engine,
            run_id,
            context,
            cancel,
            journal,
            next_seq: 0,
            status: SagaStatus::Running,
            compensations: Vec::new(),
            history: RunHistory {
                run_id: Some(run_id),
                ..RunHistory::default()
            },
        }
    }

    /// Run id
    #[inline]
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Current status
    #[inline]
    #[must_use]
    pub fn status(&self) -> SagaStatus {
        self.status
    }

    /// Caller context propagated to every invocation
    #[inline]
    #[must_use]
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Orchestrator configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &crate::config::OrchestratorConfig {
        &self.engine.config
    }

    /// Check if cancellation was requested
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of registered, not yet unwound compensations
    #[inline]
    #[must_use]
    pub fn pending_compensations(&self) -> usize {
        self.compensations.len()
    }

    /// History so far
    #[inline]
    #[must_use]
    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    /// Report what the run achieved before failing
    ///
    /// Blueprints call this on their error path; the value travels with the
    /// [`crate::SagaFailure`] history. Later calls replace earlier ones.
    pub fn set_partial_output<T: Serialize>(&mut self, output: &T) {
        match serde_json::to_value(output) {
            Ok(value) => self.history.partial_output = Some(value),
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, error = %e, "partial output not recorded");
            }
        }
    }

    pub(crate) fn into_history(self) -> RunHistory {
        self.history
    }

    pub(crate) fn transition(&mut self, to: SagaStatus) -> Result<(), SagaError> {
        validate_transition(self.status, to)?;
        tracing::debug!(run_id = %self.run_id, from = ?self.status, to = ?to, "saga transition");
        self.status = to;
        self.history.status = to;
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), SagaError> {
        if self.status == SagaStatus::Running {
            Ok(())
        } else {
            Err(SagaError::NotRunning(self.status))
        }
    }

    fn recorded(&self, seq: u64) -> Option<&JournalRecord> {
        usize::try_from(seq)
            .ok()
            .and_then(|i| self.journal.get(i))
            .map(|entry| &entry.record)
    }

    async fn record(&mut self, record: JournalRecord) -> Result<u64, SagaError> {
        let seq = self.next_seq;
        self.engine
            .substrate
            .append(self.run_id, JournalEntry::new(seq, record))
            .await?;
        self.next_seq += 1;
        Ok(seq)
    }

    /// Invoke a capability by id
    ///
    /// Resolves the latest version from the registry, validates the
    /// arguments once and dispatches through the retry policy and the
    /// sandbox runtime.
    ///
    /// # Errors
    /// The capability's error after retries, [`SagaError::Cancelled`], or a
    /// journal failure.
    pub async fn execute_by_id(&mut self, cap_id: &str, args: Value) -> Result<Value, SagaError> {
        self.ensure_running()?;
        if let Some(replayed) = self.replay_step(cap_id)? {
            return replayed;
        }
        if self.cancel.is_cancelled() {
            return Err(SagaError::Cancelled);
        }

        let engine = Arc::clone(&self.engine);
        let validated = match engine.validate(cap_id, args, &self.context) {
            Ok(pair) => pair,
            Err(error) => return self.finish_step(cap_id, Err(error), 0).await,
        };
        let (capability, validated) = validated;
        self.dispatch(capability, &validated).await
    }

    /// Invoke a capability and decode its output
    ///
    /// # Errors
    /// As [`Saga::execute_by_id`], plus [`SagaError::OutputDecode`].
    pub async fn execute_as<T: DeserializeOwned>(
        &mut self,
        cap_id: &str,
        args: Value,
    ) -> Result<T, SagaError> {
        let output = self.execute_by_id(cap_id, args).await?;
        serde_json::from_value(output).map_err(|e| SagaError::OutputDecode {
            cap_id: cap_id.to_string(),
            reason: e.to_string(),
        })
    }

    /// Dispatch an invocation that was validated by the caller
    pub(crate) async fn execute_validated(
        &mut self,
        capability: &RegisteredCapability,
        validated: &ValidatedInvocation,
    ) -> Result<Value, SagaError> {
        self.ensure_running()?;
        let cap_id = capability.descriptor().id();
        if let Some(replayed) = self.replay_step(cap_id)? {
            return replayed;
        }
        if self.cancel.is_cancelled() {
            return Err(SagaError::Cancelled);
        }
        self.dispatch(capability, validated).await
    }

    async fn dispatch(
        &mut self,
        capability: &RegisteredCapability,
        validated: &ValidatedInvocation,
    ) -> Result<Value, SagaError> {
        let cap_id = capability.descriptor().id();
        tracing::info!(
            run_id = %self.run_id,
            cap_id,
            seq = self.next_seq,
            trace_id = %self.context.trace_id,
            "step started"
        );
        let sleeper = JournaledSleep {
            substrate: self.engine.substrate.as_ref(),
            run_id: self.run_id,
            scope: TimerScope::Forward,
            seq: self.next_seq,
            cap_id,
            cancel: &self.cancel,
        };
        let outcome = execute_with_retry(&self.engine.runtime, capability, validated, &sleeper).await;
        self.finish_step(cap_id, outcome.result, outcome.attempts).await
    }

    /// Replay the next journal entry if it exists
    fn replay_step(
        &mut self,
        cap_id: &str,
    ) -> Result<Option<Result<Value, SagaError>>, SagaError> {
        let seq = self.next_seq;
        let replayed = match self.recorded(seq) {
            None => return Ok(None),
            Some(JournalRecord::Step {
                cap_id: recorded,
                outcome,
            }) if recorded == cap_id => match outcome {
                StepOutcome::Completed { output } => Ok(output.clone()),
                StepOutcome::Failed { error } => Err(error.clone()),
            },
            Some(other) => {
                return Err(SagaError::ReplayDivergence {
                    seq,
                    expected: format!("step `{cap_id}`"),
                    found: other.describe(),
                })
            }
        };
        tracing::debug!(run_id = %self.run_id, cap_id, seq, "step replayed from journal");
        self.next_seq += 1;
        self.history.steps.push(StepRecord {
            seq,
            cap_id: cap_id.to_string(),
            replayed: true,
            error: replayed.as_ref().err().map(|e| e.kind),
        });
        Ok(Some(
            replayed.map_err(|error| SagaError::capability(cap_id, error)),
        ))
    }

    async fn finish_step(
        &mut self,
        cap_id: &str,
        result: Result<Value, CapabilityError>,
        attempts: u32,
    ) -> Result<Value, SagaError> {
        // a cancelled step has no outcome; re-driving the run executes it again
        if let Err(error) = &result {
            if error.kind == ErrorKind::Cancelled {
                tracing::info!(run_id = %self.run_id, cap_id, "step cancelled");
                return Err(SagaError::Cancelled);
            }
        }

        let outcome = match &result {
            Ok(output) => StepOutcome::Completed {
                output: output.clone(),
            },
            Err(error) => StepOutcome::Failed {
                error: error.clone(),
            },
        };
        let seq = self
            .record(JournalRecord::Step {
                cap_id: cap_id.to_string(),
                outcome,
            })
            .await?;
        self.history.steps.push(StepRecord {
            seq,
            cap_id: cap_id.to_string(),
            replayed: false,
            error: result.as_ref().err().map(|e| e.kind),
        });

        match result {
            Ok(output) => {
                tracing::info!(run_id = %self.run_id, cap_id, seq, attempts, "step completed");
                Ok(output)
            }
            Err(error) => {
                tracing::warn!(run_id = %self.run_id, cap_id, seq, attempts, error = %error, "step failed");
                Err(SagaError::capability(cap_id, error))
            }
        }
    }

    /// Push an undo step; only while RUNNING
    ///
    /// # Errors
    /// [`SagaError::NotRunning`] once the saga left the forward phase.
    pub fn add_compensation(&mut self, compensation: Compensation) -> Result<(), SagaError> {
        self.ensure_running()?;
        tracing::debug!(run_id = %self.run_id, compensation = %compensation.name, "compensation registered");
        self.compensations.push(compensation);
        Ok(())
    }

    /// Durable, replay-safe sleep
    ///
    /// # Errors
    /// [`SagaError::Cancelled`] if cancellation arrives first.
    pub async fn sleep(&mut self, duration: Duration) -> Result<(), SagaError> {
        self.ensure_running()?;
        let seq = self.next_seq;
        let recorded = self.recorded(seq).map(|record| match record {
            JournalRecord::Sleep { .. } => Ok(()),
            other => Err(other.describe()),
        });
        match recorded {
            Some(Ok(())) => {
                tracing::debug!(run_id = %self.run_id, seq, "sleep replayed from journal");
                self.next_seq += 1;
                return Ok(());
            }
            Some(Err(found)) => {
                return Err(SagaError::ReplayDivergence {
                    seq,
                    expected: "sleep".into(),
                    found,
                })
            }
            None => {}
        }

        let key = TimerKey::forward(seq, 0);
        let outcome = self
            .engine
            .substrate
            .durable_sleep(self.run_id, key, duration, &self.cancel)
            .await?;
        if outcome == SleepOutcome::Cancelled {
            tracing::info!(run_id = %self.run_id, seq, "sleep cancelled");
            return Err(SagaError::Cancelled);
        }
        self.record(JournalRecord::Sleep {
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        })
        .await?;
        Ok(())
    }

    /// Pop and run every compensation, newest first, then enter FAILED
    ///
    /// Compensation failures are logged and unwinding continues. Compensations
    /// are not subject to the run's cancellation.
    pub(crate) async fn unwind(&mut self) {
        if let Err(e) = self.transition(SagaStatus::Compensating) {
            tracing::error!(run_id = %self.run_id, error = %e, "cannot unwind");
            return;
        }
        tracing::info!(run_id = %self.run_id, pending = self.compensations.len(), "unwinding");

        while let Some(compensation) = self.compensations.pop() {
            let replayed = match self.recorded(self.next_seq) {
                Some(JournalRecord::Compensation { name, outcome }) if *name == compensation.name => {
                    Some(outcome.clone())
                }
                _ => None,
            };
            if let Some(outcome) = replayed {
                tracing::debug!(run_id = %self.run_id, compensation = %compensation.name, "compensation replayed from journal");
                self.history.compensations.push(CompensationRecord {
                    name: compensation.name,
                    outcome,
                    replayed: true,
                });
                self.next_seq += 1;
                continue;
            }

            let name = compensation.name;
            let result = match compensation.action {
                CompensationAction::Invoke { cap_id, args } => {
                    self.run_compensating_step(&cap_id, args).await
                }
                CompensationAction::Inline(action) => action().await,
            };
            let outcome = match result {
                Ok(()) => {
                    tracing::info!(run_id = %self.run_id, compensation = %name, "compensation succeeded");
                    CompensationOutcome::Succeeded
                }
                Err(message) => {
                    tracing::warn!(
                        run_id = %self.run_id,
                        compensation = %name,
                        error = %message,
                        "compensation failed, continuing unwind"
                    );
                    CompensationOutcome::Failed { message }
                }
            };

            if let Err(e) = self
                .record(JournalRecord::Compensation {
                    name: name.clone(),
                    outcome: outcome.clone(),
                })
                .await
            {
                tracing::warn!(run_id = %self.run_id, compensation = %name, error = %e, "compensation outcome not journaled");
            }
            self.history.compensations.push(CompensationRecord {
                name,
                outcome,
                replayed: false,
            });
        }

        if let Err(e) = self.transition(SagaStatus::Failed) {
            tracing::error!(run_id = %self.run_id, error = %e, "cannot enter FAILED");
        }
    }

    async fn run_compensating_step(&self, cap_id: &str, args: Value) -> Result<(), String> {
        let (capability, validated) = self
            .engine
            .validate(cap_id, args, &self.context)
            .map_err(|e| e.to_string())?;
        // fresh token: a cancelled run must still be able to undo its effects
        let cancel = CancellationToken::new();
        let sleeper = JournaledSleep {
            substrate: self.engine.substrate.as_ref(),
            run_id: self.run_id,
            scope: TimerScope::Compensation,
            seq: self.next_seq,
            cap_id,
            cancel: &cancel,
        };
        execute_with_retry(&self.engine.runtime, capability, &validated, &sleeper)
            .await
            .result
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

impl Engine {
    /// Resolve and validate one invocation
    pub(crate) fn validate(
        &self,
        cap_id: &str,
        args: Value,
        context: &ExecutionContext,
    ) -> Result<(&RegisteredCapability, ValidatedInvocation), CapabilityError> {
        let capability = self.registry.resolve(cap_id)?;
        let descriptor = capability.descriptor();
        let scoped = context.scoped_for(descriptor, self.config.capability_config(cap_id));
        let validated =
            descriptor.validate_invocation(CapabilityInvocation::new(cap_id, args, scoped))?;
        Ok((capability, validated))
    }
}
