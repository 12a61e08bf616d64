//! Error types for saga orchestration
//!
//! - [`SagaError`]: why a run stopped
//! - [`SubstrateError`]: journal and timer failures of the durable substrate
//! - [`SagaFailure`]: the original error together with the run history

use crate::saga::{RunHistory, SagaStatus};
use crate::substrate::RunId;
use stagehand_capability::{CapabilityError, ErrorKind};

/// Why a saga run stopped
#[derive(Debug, Clone, thiserror::Error)]
pub enum SagaError {
    /// A capability call failed after retries
    #[error("capability `{cap_id}` failed: {source}")]
    Capability {
        /// Capability id
        cap_id: String,
        /// Normalized capability error
        #[source]
        source: CapabilityError,
    },

    /// The run was cancelled
    #[error("run cancelled")]
    Cancelled,

    /// Illegal saga status transition
    #[error("illegal saga transition {from:?} -> {to:?}")]
    InvalidState {
        /// Current status
        from: SagaStatus,
        /// Requested status
        to: SagaStatus,
    },

    /// Operation needs a running saga
    #[error("saga is {0:?}; operation requires RUNNING")]
    NotRunning(SagaStatus),

    /// Durable substrate failure
    #[error("substrate error: {0}")]
    Substrate(#[from] SubstrateError),

    /// Blueprint input rejected before any effect
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Capability output did not decode into the expected shape
    #[error("output of `{cap_id}` could not be decoded: {reason}")]
    OutputDecode {
        /// Capability id
        cap_id: String,
        /// Decoder message
        reason: String,
    },

    /// No blueprint registered under the id
    #[error("unknown blueprint `{0}`")]
    UnknownBlueprint(String),

    /// Replayed journal does not match the effects the blueprint requested
    #[error("replay diverged at seq {seq}: journal has {found}, run requested {expected}")]
    ReplayDivergence {
        /// Sequence number
        seq: u64,
        /// Effect the run requested
        expected: String,
        /// Effect recorded in the journal
        found: String,
    },
}

impl SagaError {
    /// Wrap a capability error
    #[must_use]
    pub fn capability(cap_id: impl Into<String>, source: CapabilityError) -> Self {
        Self::Capability {
            cap_id: cap_id.into(),
            source,
        }
    }

    /// Check if the run stopped because of cancellation
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Capability { source, .. } => source.kind == ErrorKind::Cancelled,
            _ => false,
        }
    }

    /// Check if a later attempt of the same run could succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Capability { source, .. } => source.retryable,
            Self::Substrate(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Wire label used in tool envelopes
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Capability { source, .. } => source.kind.as_str(),
            Self::Cancelled => "CANCELLED",
            Self::InvalidState { .. } | Self::NotRunning(_) => "INVALID_STATE",
            Self::Substrate(_) => "SUBSTRATE_ERROR",
            Self::InvalidInput(_) => "VALIDATION_FAILED",
            Self::OutputDecode { .. } => "OUTPUT_DECODE_FAILED",
            Self::UnknownBlueprint(_) => "UNKNOWN_BLUEPRINT",
            Self::ReplayDivergence { .. } => "REPLAY_DIVERGENCE",
        }
    }
}

/// Durable substrate failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubstrateError {
    /// No run with this id
    #[error("run {0} not found")]
    RunNotFound(RunId),

    /// Appended entry does not continue the journal
    #[error("journal of run {run_id} expects seq {expected}, got {got}")]
    SequenceConflict {
        /// Run id
        run_id: RunId,
        /// Next free sequence number
        expected: u64,
        /// Sequence number offered
        got: u64,
    },

    /// Run already finished
    #[error("run {0} is already finished")]
    RunFinished(RunId),

    /// Storage backend failure
    #[error("storage failure: {0}")]
    Storage(String),
}

impl SubstrateError {
    /// Storage hiccups may succeed on retry; logical conflicts never do
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// A failed run: the original error plus its audit history
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error}")]
pub struct SagaFailure {
    /// Run id, if a run was started
    pub run_id: Option<RunId>,
    /// Error that stopped the forward phase
    #[source]
    pub error: SagaError,
    /// Steps and compensation outcomes
    pub history: RunHistory,
}

impl SagaFailure {
    /// Failure before any run existed
    #[must_use]
    pub fn before_start(error: SagaError) -> Self {
        Self {
            run_id: None,
            error,
            history: RunHistory::default(),
        }
    }
}
