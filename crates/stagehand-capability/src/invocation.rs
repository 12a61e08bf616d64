//! Invocation envelopes
//!
//! An [`ExecutionContext`] carries caller identity, validated config and
//! secret *references*. Raw secret values never appear here; the runtime
//! turns references into per-invocation mount paths.

use crate::descriptor::CapabilityDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Opaque reference to secret material (a path or a store handle)
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretRef(String);

impl SecretRef {
    /// Wrap a reference
    #[must_use]
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Reference string
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretRef({})", self.0)
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller identity, config and secret references for one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    /// Application the call acts on
    pub app_id: String,
    /// Target environment (`staging`, `prod`, ...)
    pub environment: String,
    /// Who started the call
    pub initiator_id: String,
    /// Correlation id propagated through every log line
    pub trace_id: String,
    /// Capability configuration, validated against the config schema
    #[serde(default = "empty_object")]
    pub config: Value,
    /// Logical secret name to reference
    #[serde(default)]
    pub secret_refs: BTreeMap<String, SecretRef>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl ExecutionContext {
    /// Create a context with a fresh trace id
    #[must_use]
    pub fn new(
        app_id: impl Into<String>,
        environment: impl Into<String>,
        initiator_id: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            environment: environment.into(),
            initiator_id: initiator_id.into(),
            trace_id: uuid::Uuid::new_v4().to_string(),
            config: empty_object(),
            secret_refs: BTreeMap::new(),
        }
    }

    /// With an explicit trace id
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// With capability configuration
    #[must_use]
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// With a secret reference
    #[must_use]
    pub fn with_secret_ref(mut self, name: impl Into<String>, reference: SecretRef) -> Self {
        self.secret_refs.insert(name.into(), reference);
        self
    }

    /// Narrow this context to one capability
    ///
    /// Keeps only the secret references the descriptor declares and
    /// replaces the config.
    #[must_use]
    pub fn scoped_for(&self, descriptor: &CapabilityDescriptor, config: Value) -> Self {
        let declared = descriptor.declared_secrets();
        Self {
            app_id: self.app_id.clone(),
            environment: self.environment.clone(),
            initiator_id: self.initiator_id.clone(),
            trace_id: self.trace_id.clone(),
            config,
            secret_refs: self
                .secret_refs
                .iter()
                .filter(|(name, _)| declared.contains(name))
                .map(|(name, r)| (name.clone(), r.clone()))
                .collect(),
        }
    }
}

/// Request to run a capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityInvocation {
    /// Target capability id
    pub cap_id: String,
    /// Arguments, checked against the input schema
    pub args: Value,
    /// Caller context
    pub context: ExecutionContext,
}

impl CapabilityInvocation {
    /// Create an invocation
    #[must_use]
    pub fn new(cap_id: impl Into<String>, args: Value, context: ExecutionContext) -> Self {
        Self {
            cap_id: cap_id.into(),
            args,
            context,
        }
    }
}

/// Invocation that passed descriptor validation
///
/// Only [`CapabilityDescriptor::validate_invocation`] constructs this type,
/// so the runtime can never be entered with unvalidated arguments.
#[derive(Debug, Clone)]
pub struct ValidatedInvocation {
    inner: CapabilityInvocation,
}

impl ValidatedInvocation {
    pub(crate) fn new(inner: CapabilityInvocation) -> Self {
        Self { inner }
    }

    /// Capability id
    #[inline]
    #[must_use]
    pub fn cap_id(&self) -> &str {
        &self.inner.cap_id
    }

    /// Validated arguments
    #[inline]
    #[must_use]
    pub fn args(&self) -> &Value {
        &self.inner.args
    }

    /// Caller context
    #[inline]
    #[must_use]
    pub fn context(&self) -> &ExecutionContext {
        &self.inner.context
    }
}
