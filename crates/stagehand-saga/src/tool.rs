//! Schema-gated tool surface
//!
//! Looks up a capability or blueprint by id, validates the arguments against
//! its input schema and forwards the call. Every call answers with a
//! [`ToolEnvelope`]:
//!
//! ```json
//! { "result": { ... }, "trace_id": "..." }
//! { "error": { "kind": "VALIDATION_FAILED", "message": "..." }, "trace_id": "...", "details": { ... } }
//! ```

use crate::blueprint::BlueprintRegistry;
use crate::error::{SagaError, SagaFailure};
use crate::orchestrator::{Orchestrator, RunOptions};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use stagehand_capability::{CapabilityError, ErrorKind, ExecutionContext, SchemaValidator};
use std::collections::BTreeMap;

/// Error half of a failed envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolError {
    /// Wire label, e.g. `OUTBOUND_HOST_NOT_ALLOWED`
    pub kind: String,
    /// Human-readable message
    pub message: String,
}

/// Answer of one tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolEnvelope {
    /// Call succeeded
    Ok {
        /// Capability or blueprint output
        result: Value,
        /// Trace id of the call
        trace_id: String,
    },
    /// Call failed
    Err {
        /// What went wrong
        error: ToolError,
        /// Trace id of the call
        trace_id: String,
        /// Violations, run id and run history when available
        details: Value,
    },
}

impl ToolEnvelope {
    /// Check if the call succeeded
    #[inline]
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// Error kind of a failed call
    #[must_use]
    pub fn error_kind(&self) -> Option<&str> {
        match self {
            Self::Ok { .. } => None,
            Self::Err { error, .. } => Some(&error.kind),
        }
    }

    fn failure(kind: &str, message: impl Into<String>, trace_id: String, details: Value) -> Self {
        Self::Err {
            error: ToolError {
                kind: kind.to_string(),
                message: message.into(),
            },
            trace_id,
            details,
        }
    }

    fn from_saga_failure(failure: &SagaFailure, trace_id: String) -> Self {
        let mut details = json!({
            "runId": failure.run_id.map(|id| id.to_string()),
            "history": failure.history,
        });
        if let Some(output) = &failure.history.partial_output {
            details["output"] = output.clone();
        }
        if let SagaError::Capability { source, .. } = &failure.error {
            if !source.violations.is_empty() {
                details["violations"] = json!(source.violations);
            }
        }
        let message = match &failure.error {
            SagaError::Capability { source, .. } => source.message.clone(),
            other => other.to_string(),
        };
        Self::failure(failure.error.kind(), message, trace_id, details)
    }
}

/// Kind of tool behind an id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    /// Single capability invocation
    Capability,
    /// Blueprint run
    Blueprint,
}

/// Listing entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    /// Tool id
    pub id: String,
    /// Capability or blueprint
    pub kind: ToolKind,
    /// Input JSON Schema
    pub input_schema: Value,
}

/// Capabilities and blueprints exposed by id
#[derive(Debug, Clone)]
pub struct ToolSurface {
    orchestrator: Orchestrator,
    blueprints: BlueprintRegistry,
    blueprint_schemas: BTreeMap<&'static str, SchemaValidator>,
}

impl ToolSurface {
    /// Expose every capability of the orchestrator's registry and every
    /// blueprint whose input schema compiles
    #[must_use]
    pub fn new(orchestrator: Orchestrator, blueprints: BlueprintRegistry) -> Self {
        let mut blueprint_schemas = BTreeMap::new();
        for id in blueprints.ids() {
            let Some(blueprint) = blueprints.get(id) else {
                continue;
            };
            match SchemaValidator::compile(blueprint.schema()) {
                Ok(validator) => {
                    blueprint_schemas.insert(id, validator);
                }
                Err(e) => {
                    tracing::error!(blueprint = id, error = %e, "input schema does not compile; blueprint not exposed");
                }
            }
        }
        Self {
            orchestrator,
            blueprints,
            blueprint_schemas,
        }
    }

    /// Orchestrator behind the surface
    #[inline]
    #[must_use]
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Every exposed tool, capabilities first
    #[must_use]
    pub fn tools(&self) -> Vec<ToolInfo> {
        let registry = self.orchestrator.registry();
        let capabilities = registry.ids().into_iter().filter_map(|id| {
            registry.latest(id).map(|capability| ToolInfo {
                id: id.to_string(),
                kind: ToolKind::Capability,
                input_schema: capability.descriptor().schemas().input.schema().clone(),
            })
        });
        let blueprints = self.blueprint_schemas.iter().map(|(id, validator)| ToolInfo {
            id: (*id).to_string(),
            kind: ToolKind::Blueprint,
            input_schema: validator.schema().clone(),
        });
        capabilities.chain(blueprints).collect()
    }

    /// Call a tool with a fresh cancellation token
    pub async fn call(&self, id: &str, args: Value, context: ExecutionContext) -> ToolEnvelope {
        self.call_with(id, args, RunOptions::new(context)).await
    }

    /// Call a tool
    ///
    /// Capability arguments are validated once by the orchestrator before the
    /// sandbox is entered; blueprint input is validated here before a run is
    /// started.
    pub async fn call_with(&self, id: &str, args: Value, options: RunOptions) -> ToolEnvelope {
        let trace_id = options.context.trace_id.clone();
        tracing::info!(tool = id, trace_id = %trace_id, "tool call");

        if self.orchestrator.registry().contains(id) {
            return match self.orchestrator.execute_by_id(id, args, options).await {
                Ok(result) => ToolEnvelope::Ok { result, trace_id },
                Err(failure) => ToolEnvelope::from_saga_failure(&failure, trace_id),
            };
        }

        let (Some(blueprint), Some(validator)) =
            (self.blueprints.get(id), self.blueprint_schemas.get(id))
        else {
            let error = CapabilityError::unknown_capability(id);
            return ToolEnvelope::failure(
                ErrorKind::UnknownCapability.as_str(),
                error.message,
                trace_id,
                json!({ "id": id }),
            );
        };

        if let Err(violations) = validator.validate(&args) {
            let error = CapabilityError::validation(&format!("input of `{id}`"), violations);
            tracing::debug!(tool = id, trace_id = %trace_id, error = %error, "tool input rejected");
            return ToolEnvelope::failure(
                error.kind.as_str(),
                error.message,
                trace_id,
                json!({ "violations": error.violations }),
            );
        }

        match blueprint.start_json(&self.orchestrator, args, options).await {
            Ok(report) => ToolEnvelope::Ok {
                result: json!({
                    "runId": report.run_id.to_string(),
                    "output": report.output,
                    "history": report.history,
                }),
                trace_id,
            },
            Err(failure) => ToolEnvelope::from_saga_failure(&failure, trace_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_serialize_flat() {
        let ok = ToolEnvelope::Ok {
            result: json!({ "a": 1 }),
            trace_id: "t-1".into(),
        };
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({ "result": { "a": 1 }, "trace_id": "t-1" })
        );

        let err = ToolEnvelope::failure("FATAL", "boom", "t-2".into(), json!({}));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["error"]["kind"], "FATAL");
        assert_eq!(value["trace_id"], "t-2");
        assert_eq!(value["details"], json!({}));
        assert_eq!(err.error_kind(), Some("FATAL"));
    }

    #[test]
    fn envelope_round_trips_untagged() {
        let err = ToolEnvelope::failure("UNKNOWN_CAPABILITY", "nope", "t".into(), json!({ "id": "x" }));
        let back: ToolEnvelope = serde_json::from_value(serde_json::to_value(&err).unwrap()).unwrap();
        assert_eq!(back, err);
        assert!(!back.is_ok());
    }
}
