//! Durable execution substrate
//!
//! The substrate owns everything that must survive a crash of the process
//! driving a run:
//! - the run's blueprint id and input
//! - an append-only journal of effect outcomes, indexed by sequence number
//! - durable timers keyed by `(run, seq, attempt)`
//!
//! Re-driving a run against its journal replays recorded outcomes instead
//! of re-executing effects. A timer keeps its original deadline, so a sleep
//! interrupted by a crash resumes with only the remaining time.

use crate::error::SubstrateError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagehand_capability::CapabilityError;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

/// Sortable run identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Ulid);

impl RunId {
    /// Fresh id
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for RunId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Phase of the run a timer was started in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerScope {
    /// Forward steps and plain sleeps
    Forward,
    /// Retry waits of compensating steps
    Compensation,
}

/// Identity of a durable timer within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey {
    /// Phase the timer belongs to
    pub scope: TimerScope,
    /// Sequence number of the effect the timer belongs to
    pub seq: u64,
    /// Retry attempt the wait precedes (`0` for plain sleeps)
    pub attempt: u32,
}

impl TimerKey {
    /// Timer of a forward effect
    #[inline]
    #[must_use]
    pub fn forward(seq: u64, attempt: u32) -> Self {
        Self {
            scope: TimerScope::Forward,
            seq,
            attempt,
        }
    }

    /// Retry timer of a compensating step
    #[inline]
    #[must_use]
    pub fn compensation(seq: u64, attempt: u32) -> Self {
        Self {
            scope: TimerScope::Compensation,
            seq,
            attempt,
        }
    }
}

/// Outcome of a capability step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutcome {
    /// Output returned by the capability
    Completed {
        /// Capability output
        output: Value,
    },
    /// Error surfaced after retries
    Failed {
        /// Normalized error
        error: CapabilityError,
    },
}

/// Outcome of a compensation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationOutcome {
    /// Undo action succeeded
    Succeeded,
    /// Undo action failed; unwinding continued
    Failed {
        /// Failure message
        message: String,
    },
}

/// What a journal entry records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JournalRecord {
    /// Capability invocation
    #[serde(rename_all = "camelCase")]
    Step {
        /// Capability id
        cap_id: String,
        /// Recorded outcome
        outcome: StepOutcome,
    },
    /// Completed durable sleep
    #[serde(rename_all = "camelCase")]
    Sleep {
        /// Requested duration
        duration_ms: u64,
    },
    /// Compensation run during unwind
    Compensation {
        /// Compensation name
        name: String,
        /// Recorded outcome
        outcome: CompensationOutcome,
    },
}

impl JournalRecord {
    /// Short description used in divergence reports
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Step { cap_id, .. } => format!("step `{cap_id}`"),
            Self::Sleep { duration_ms } => format!("sleep {duration_ms}ms"),
            Self::Compensation { name, .. } => format!("compensation `{name}`"),
        }
    }
}

/// One journaled effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    /// Position in the journal
    pub seq: u64,
    /// When the outcome was recorded
    pub recorded_at: DateTime<Utc>,
    /// Recorded effect
    pub record: JournalRecord,
}

impl JournalEntry {
    /// Entry stamped now
    #[must_use]
    pub fn new(seq: u64, record: JournalRecord) -> Self {
        Self {
            seq,
            recorded_at: Utc::now(),
            record,
        }
    }
}

/// Lifecycle of a stored run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Not finished (possibly interrupted)
    Running,
    /// Forward phase completed
    Completed,
    /// Unwound after an error
    Failed,
}

/// Handle returned when a run is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    /// Run id
    pub run_id: RunId,
    /// Blueprint the run executes
    pub blueprint_id: String,
    /// Creation time
    pub started_at: DateTime<Utc>,
}

/// Stored state of a run
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    /// Run id
    pub run_id: RunId,
    /// Blueprint the run executes
    pub blueprint_id: String,
    /// Blueprint input
    pub input: Value,
    /// Journal in sequence order
    pub journal: Vec<JournalEntry>,
    /// Lifecycle status
    pub status: RunStatus,
}

/// How a durable sleep ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// Deadline reached
    Elapsed,
    /// Cancellation observed first
    Cancelled,
}

/// Durable execution backend
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Create a run
    async fn start_run(&self, blueprint_id: &str, input: Value)
        -> Result<RunHandle, SubstrateError>;

    /// Load a run for re-driving
    async fn load_run(&self, run_id: RunId) -> Result<RunSnapshot, SubstrateError>;

    /// Journal of a run in sequence order
    async fn journal(&self, run_id: RunId) -> Result<Vec<JournalEntry>, SubstrateError> {
        Ok(self.load_run(run_id).await?.journal)
    }

    /// Append the next entry; `entry.seq` must equal the journal length
    async fn append(&self, run_id: RunId, entry: JournalEntry) -> Result<(), SubstrateError>;

    /// Suspend until the timer identified by `key` fires
    ///
    /// The deadline is fixed the first time a key is seen; later calls with
    /// the same key wait only for what remains.
    async fn durable_sleep(
        &self,
        run_id: RunId,
        key: TimerKey,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<SleepOutcome, SubstrateError>;

    /// Mark a run finished and release its timers
    async fn finish_run(&self, run_id: RunId, status: RunStatus) -> Result<(), SubstrateError>;

    /// Forget a run: journal, input and timers
    async fn retire_run(&self, run_id: RunId) -> Result<(), SubstrateError>;
}

#[derive(Debug)]
struct StoredRun {
    blueprint_id: String,
    input: Value,
    journal: Vec<JournalEntry>,
    status: RunStatus,
    sleeps: Vec<Duration>,
}

/// Process-local substrate
///
/// Durable for the lifetime of the process; used by tests, the CLI and as
/// the reference for persistent backends.
#[derive(Debug, Default)]
pub struct InMemorySubstrate {
    runs: DashMap<RunId, StoredRun>,
    timers: DashMap<(RunId, TimerKey), Instant>,
}

impl InMemorySubstrate {
    /// Create new empty substrate
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of every stored run, oldest first
    #[must_use]
    pub fn run_ids(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self.runs.iter().map(|r| *r.key()).collect();
        ids.sort();
        ids
    }

    /// Durations requested through [`Substrate::durable_sleep`] for `run_id`
    #[must_use]
    pub fn sleeps(&self, run_id: RunId) -> Vec<Duration> {
        self.runs
            .get(&run_id)
            .map(|r| r.sleeps.clone())
            .unwrap_or_default()
    }

    /// Status of a run
    #[must_use]
    pub fn status(&self, run_id: RunId) -> Option<RunStatus> {
        self.runs.get(&run_id).map(|r| r.status)
    }
}

#[async_trait]
impl Substrate for InMemorySubstrate {
    async fn start_run(
        &self,
        blueprint_id: &str,
        input: Value,
    ) -> Result<RunHandle, SubstrateError> {
        let run_id = RunId::new();
        self.runs.insert(
            run_id,
            StoredRun {
                blueprint_id: blueprint_id.to_string(),
                input,
                journal: Vec::new(),
                status: RunStatus::Running,
                sleeps: Vec::new(),
            },
        );
        tracing::debug!(run_id = %run_id, blueprint = blueprint_id, "run created");
        Ok(RunHandle {
            run_id,
            blueprint_id: blueprint_id.to_string(),
            started_at: Utc::now(),
        })
    }

    async fn load_run(&self, run_id: RunId) -> Result<RunSnapshot, SubstrateError> {
        let run = self
            .runs
            .get(&run_id)
            .ok_or(SubstrateError::RunNotFound(run_id))?;
        Ok(RunSnapshot {
            run_id,
            blueprint_id: run.blueprint_id.clone(),
            input: run.input.clone(),
            journal: run.journal.clone(),
            status: run.status,
        })
    }

    async fn append(&self, run_id: RunId, entry: JournalEntry) -> Result<(), SubstrateError> {
        let mut run = self
            .runs
            .get_mut(&run_id)
            .ok_or(SubstrateError::RunNotFound(run_id))?;
        if run.status != RunStatus::Running {
            return Err(SubstrateError::RunFinished(run_id));
        }
        let expected = run.journal.len() as u64;
        if entry.seq != expected {
            return Err(SubstrateError::SequenceConflict {
                run_id,
                expected,
                got: entry.seq,
            });
        }
        run.journal.push(entry);
        Ok(())
    }

    async fn durable_sleep(
        &self,
        run_id: RunId,
        key: TimerKey,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<SleepOutcome, SubstrateError> {
        {
            let mut run = self
                .runs
                .get_mut(&run_id)
                .ok_or(SubstrateError::RunNotFound(run_id))?;
            run.sleeps.push(duration);
        }
        let deadline = *self
            .timers
            .entry((run_id, key))
            .or_insert_with(|| Instant::now() + duration);

        tokio::select! {
            () = tokio::time::sleep_until(deadline) => Ok(SleepOutcome::Elapsed),
            () = cancel.cancelled() => Ok(SleepOutcome::Cancelled),
        }
    }

    async fn finish_run(&self, run_id: RunId, status: RunStatus) -> Result<(), SubstrateError> {
        {
            let mut run = self
                .runs
                .get_mut(&run_id)
                .ok_or(SubstrateError::RunNotFound(run_id))?;
            run.status = status;
        }
        self.timers.retain(|(id, _), _| *id != run_id);
        tracing::debug!(run_id = %run_id, status = ?status, "run finished");
        Ok(())
    }

    async fn retire_run(&self, run_id: RunId) -> Result<(), SubstrateError> {
        self.runs
            .remove(&run_id)
            .ok_or(SubstrateError::RunNotFound(run_id))?;
        self.timers.retain(|(id, _), _| *id != run_id);
        tracing::debug!(run_id = %run_id, "run retired");
        Ok(())
    }
}
