//! Error types for capability execution
//!
//! Every execution path of a capability terminates in exactly one
//! [`CapabilityResult`]. The error side carries a stable [`ErrorKind`]
//! so callers can tell policy failures (validation, secrets, egress) from
//! failures raised by the capability's own unit of work.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome envelope of a single capability invocation
pub type CapabilityResult = Result<serde_json::Value, CapabilityError>;

/// Stable error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Input, output or config did not match the declared schema
    ValidationFailed,
    /// A secret the capability requires has no reference
    MissingSecret,
    /// Outbound call to a host outside the allowlist
    OutboundHostNotAllowed,
    /// Transient failure, classified retryable by the capability
    Retryable,
    /// Permanent failure, classified fatal by the capability
    Fatal,
    /// The sandbox itself failed (panic, aborted task); always fatal, the
    /// capability's classifier is not consulted
    RunnerError,
    /// Execution exceeded the configured timeout; always retryable, the
    /// capability's classifier is not consulted
    Timeout,
    /// No capability registered under the requested id
    UnknownCapability,
    /// The invocation was cancelled while suspended
    Cancelled,
}

impl ErrorKind {
    /// Wire label, e.g. `OUTBOUND_HOST_NOT_ALLOWED`
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::MissingSecret => "MISSING_SECRET",
            Self::OutboundHostNotAllowed => "OUTBOUND_HOST_NOT_ALLOWED",
            Self::Retryable => "RETRYABLE",
            Self::Fatal => "FATAL",
            Self::RunnerError => "RUNNER_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::UnknownCapability => "UNKNOWN_CAPABILITY",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Policy failures are raised by the runtime before or around the
    /// unit of work and are never retried.
    #[inline]
    #[must_use]
    pub fn is_policy(&self) -> bool {
        matches!(
            self,
            Self::ValidationFailed
                | Self::MissingSecret
                | Self::OutboundHostNotAllowed
                | Self::UnknownCapability
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single schema violation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    /// JSON pointer of the offending field (`""` is the document root)
    pub field: String,
    /// Validator message
    pub message: String,
}

/// Error side of a [`CapabilityResult`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CapabilityError {
    /// Error classification
    pub kind: ErrorKind,
    /// Human-readable message, never containing secret material
    pub message: String,
    /// Whether the retry policy may attempt the call again
    pub retryable: bool,
    /// Offending fields for `VALIDATION_FAILED`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<FieldViolation>,
}

impl CapabilityError {
    fn new(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable,
            violations: Vec::new(),
        }
    }

    /// Schema mismatch with the list of offending fields
    #[must_use]
    pub fn validation(what: &str, violations: Vec<FieldViolation>) -> Self {
        let fields: Vec<&str> = violations.iter().map(|v| v.field.as_str()).collect();
        let mut err = Self::new(
            ErrorKind::ValidationFailed,
            format!("{what} failed schema validation at [{}]", fields.join(", ")),
            false,
        );
        err.violations = violations;
        err
    }

    /// Required secret has no reference
    #[must_use]
    pub fn missing_secret(capability: &str, secret_name: &str) -> Self {
        Self::new(
            ErrorKind::MissingSecret,
            format!("capability `{capability}` requires secret `{secret_name}`"),
            false,
        )
    }

    /// Host rejected by the egress allowlist
    #[must_use]
    pub fn outbound_denied(capability: &str, host: &str) -> Self {
        Self::new(
            ErrorKind::OutboundHostNotAllowed,
            format!("capability `{capability}` may not contact host `{host}`"),
            false,
        )
    }

    /// Failure classified by the capability
    #[must_use]
    pub fn classified(classification: Classification, message: impl Into<String>) -> Self {
        match classification {
            Classification::Retryable => Self::new(ErrorKind::Retryable, message, true),
            Classification::Fatal => Self::new(ErrorKind::Fatal, message, false),
        }
    }

    /// Uncaught sandbox failure
    #[must_use]
    pub fn runner(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RunnerError, message, false)
    }

    /// Execution exceeded its timeout
    #[must_use]
    pub fn timeout(capability: &str, seconds: u64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("capability `{capability}` timed out after {seconds}s"),
            true,
        )
    }

    /// No capability registered under `id`
    #[must_use]
    pub fn unknown_capability(id: &str) -> Self {
        Self::new(
            ErrorKind::UnknownCapability,
            format!("unknown capability `{id}`"),
            false,
        )
    }

    /// Suspended invocation was cancelled
    #[must_use]
    pub fn cancelled(capability: &str) -> Self {
        Self::new(
            ErrorKind::Cancelled,
            format!("invocation of `{capability}` cancelled"),
            false,
        )
    }

    /// Replace every occurrence of `needle` in the message
    pub(crate) fn redact(&mut self, needle: &str, replacement: &str) {
        if !needle.is_empty() && self.message.contains(needle) {
            self.message = self.message.replace(needle, replacement);
        }
        for violation in &mut self.violations {
            if !needle.is_empty() && violation.message.contains(needle) {
                violation.message = violation.message.replace(needle, replacement);
            }
        }
    }
}

/// Two-valued error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    /// Retry with backoff
    Retryable,
    /// Surface immediately
    Fatal,
}

impl Classification {
    /// Normalize a classifier label
    ///
    /// `TRANSIENT` is accepted as an alias of `RETRYABLE`; any label that is
    /// not recognized is fatal.
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "RETRYABLE" | "TRANSIENT" => Self::Retryable,
            _ => Self::Fatal,
        }
    }
}

/// Error returned by a capability's unit of work
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// A runtime gate refused the work (egress, secrets); passed through unchanged
    #[error(transparent)]
    Policy(#[from] CapabilityError),

    /// The unit of work failed; classified by the descriptor
    #[error("{message}")]
    Failed {
        /// Failure message
        message: String,
        /// Optional classifier label set by the handler (`RETRYABLE`, `FATAL`, `TRANSIENT`)
        label: Option<String>,
    },
}

impl HandlerError {
    /// Unlabelled failure, classified by message shape
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            label: None,
        }
    }

    /// Failure carrying an explicit classifier label
    pub fn labelled(message: impl Into<String>, label: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            label: Some(label.into()),
        }
    }
}

/// Descriptor construction errors
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    /// Id is empty or not namespaced (`group.name`)
    #[error("invalid capability id `{0}`: expected a namespaced id such as `k8s.apply`")]
    InvalidId(String),

    /// Version is not `MAJOR.MINOR.PATCH`
    #[error("invalid capability version `{0}`")]
    InvalidVersion(String),

    /// A schema failed to compile
    #[error("{which} schema does not compile: {reason}")]
    InvalidSchema {
        /// Which schema (`input`, `output`, `config`, `secrets`)
        which: &'static str,
        /// Compiler message
        reason: String,
    },

    /// Retry policy values out of range
    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(String),

    /// Execution timeout of zero seconds
    #[error("execution timeout must be at least one second")]
    InvalidTimeout,

    /// Same `(id, version)` published twice
    #[error("capability `{id}@{version}` is already registered")]
    AlreadyRegistered {
        /// Capability id
        id: String,
        /// Capability version
        version: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_label_normalizes_to_retryable() {
        assert_eq!(Classification::from_label("TRANSIENT"), Classification::Retryable);
        assert_eq!(Classification::from_label("retryable"), Classification::Retryable);
        assert_eq!(Classification::from_label("FATAL"), Classification::Fatal);
        assert_eq!(Classification::from_label("weird"), Classification::Fatal);
    }

    #[test]
    fn policy_errors_are_not_retryable() {
        assert!(!CapabilityError::missing_secret("k8s.apply", "kubeconfig").retryable);
        assert!(!CapabilityError::outbound_denied("k8s.apply", "evil.com").retryable);
        assert!(ErrorKind::OutboundHostNotAllowed.is_policy());
        assert!(!ErrorKind::Retryable.is_policy());
    }

    #[test]
    fn validation_error_lists_fields() {
        let err = CapabilityError::validation(
            "input",
            vec![FieldViolation {
                field: "/image".into(),
                message: "required".into(),
            }],
        );
        assert_eq!(err.kind, ErrorKind::ValidationFailed);
        assert!(err.message.contains("/image"));
        assert_eq!(err.violations.len(), 1);
    }

    #[test]
    fn error_kind_serializes_as_wire_label() {
        let json = serde_json::to_string(&ErrorKind::OutboundHostNotAllowed).unwrap();
        assert_eq!(json, "\"OUTBOUND_HOST_NOT_ALLOWED\"");
        assert_eq!(ErrorKind::RunnerError.to_string(), "RUNNER_ERROR");
    }

    #[test]
    fn redact_scrubs_message() {
        let mut err = CapabilityError::runner("token hunter2 rejected");
        err.redact("hunter2", "[redacted:token]");
        assert_eq!(err.message, "token [redacted:token] rejected");
    }
}
