//! Egress-gated execution runtime
//!
//! Given a validated invocation the runtime:
//! 1. mounts the invocation's secrets (fails closed on a missing one)
//! 2. builds the egress gate from the descriptor's allowlist
//! 3. runs the unit of work in its own task, optionally under a timeout
//! 4. normalizes every outcome into exactly one [`CapabilityResult`]
//!
//! Secret scopes are discarded when the call returns. Outputs and error
//! messages are scrubbed of mounted secret material before they leave.
//!
//! Timeouts (`TIMEOUT`, retryable) and sandbox task failures
//! (`RUNNER_ERROR`, fatal) never reach the descriptor's classifier: the
//! handler produced no error to classify.

use crate::egress::EgressGate;
use crate::error::{CapabilityError, CapabilityResult, HandlerError};
use crate::invocation::{ExecutionContext, ValidatedInvocation};
use crate::registry::RegisteredCapability;
use crate::secrets::{mount_secrets, SecretMounts, SecretStore};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Everything a unit of work may touch
#[derive(Debug, Clone)]
pub struct SandboxContext {
    /// Caller context (secret refs only, never values)
    pub context: ExecutionContext,
    /// Mounted secrets for this invocation
    pub secrets: SecretMounts,
    /// Outbound allowlist gate
    pub egress: EgressGate,
}

/// A capability's unit of work
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// Run with validated `input`
    async fn run(&self, input: Value, sandbox: SandboxContext) -> Result<Value, HandlerError>;
}

/// Sandboxed executor for validated invocations
#[derive(Clone)]
pub struct ExecutionRuntime {
    secret_store: Arc<dyn SecretStore>,
    mount_root: PathBuf,
    default_timeout: Option<Duration>,
}

impl std::fmt::Debug for ExecutionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionRuntime")
            .field("mount_root", &self.mount_root)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl ExecutionRuntime {
    /// Create a runtime mounting secrets under `mount_root`
    #[must_use]
    pub fn new(secret_store: Arc<dyn SecretStore>, mount_root: impl Into<PathBuf>) -> Self {
        Self {
            secret_store,
            mount_root: mount_root.into(),
            default_timeout: None,
        }
    }

    /// Timeout applied when a descriptor declares none
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Execute one attempt
    pub async fn execute(
        &self,
        capability: &RegisteredCapability,
        invocation: ValidatedInvocation,
    ) -> CapabilityResult {
        let descriptor = capability.descriptor();
        let cap_id = descriptor.id().to_string();
        let trace_id = invocation.context().trace_id.clone();

        let secrets = mount_secrets(
            self.secret_store.as_ref(),
            &self.mount_root,
            descriptor,
            invocation.context(),
        )
        .await?;
        let secret_material = read_material(&secrets).await;

        let sandbox = SandboxContext {
            context: invocation.context().clone(),
            secrets: secrets.clone(),
            egress: EgressGate::new(&cap_id, descriptor.security().egress.clone()),
        };
        let handler = capability.handler();
        let input = invocation.args().clone();

        tracing::info!(capability = %cap_id, trace_id = %trace_id, "entering sandbox");
        let mut task = tokio::spawn(async move { handler.run(input, sandbox).await });

        let timeout = descriptor
            .operations()
            .timeout_secs
            .map(Duration::from_secs)
            .or(self.default_timeout);

        let joined = match timeout {
            None => Some((&mut task).await),
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => Some(joined),
                Err(_) => {
                    task.abort();
                    None
                }
            },
        };

        let mut result = match joined {
            None => Err(CapabilityError::timeout(
                &cap_id,
                timeout.map_or(0, |t| t.as_secs()),
            )),
            Some(Err(join_error)) => {
                let reason = if join_error.is_panic() {
                    "sandbox task panicked"
                } else {
                    "sandbox task was aborted"
                };
                tracing::error!(capability = %cap_id, trace_id = %trace_id, reason, "runner failure");
                Err(CapabilityError::runner(format!("capability `{cap_id}`: {reason}")))
            }
            Some(Ok(Err(HandlerError::Policy(error)))) => Err(error),
            Some(Ok(Err(failure))) => {
                let classification = descriptor.operations().classify(&failure);
                Err(CapabilityError::classified(classification, failure.to_string()))
            }
            Some(Ok(Ok(output))) => descriptor.validate_output(&output).map(|()| output),
        };

        secrets.discard().await;

        match &mut result {
            Err(error) => {
                for (name, material) in &secret_material {
                    error.redact(material, &format!("[redacted:{name}]"));
                }
                tracing::info!(capability = %cap_id, trace_id = %trace_id, kind = %error.kind, "capability failed");
            }
            Ok(output) => {
                let mut scrubbed = 0;
                for (name, material) in &secret_material {
                    scrubbed += redact_value(output, material, &format!("[redacted:{name}]"));
                }
                if scrubbed > 0 {
                    tracing::warn!(capability = %cap_id, trace_id = %trace_id, scrubbed, "secret material removed from output");
                }
                tracing::info!(capability = %cap_id, trace_id = %trace_id, "capability succeeded");
            }
        }
        result
    }
}

/// Replace `needle` in every string and object key of `value`
///
/// Returns the number of strings changed.
fn redact_value(value: &mut Value, needle: &str, replacement: &str) -> usize {
    match value {
        Value::String(text) if text.contains(needle) => {
            *text = text.replace(needle, replacement);
            1
        }
        Value::Array(items) => items
            .iter_mut()
            .map(|item| redact_value(item, needle, replacement))
            .sum(),
        Value::Object(map) => {
            let mut changed = 0;
            if map.keys().any(|key| key.contains(needle)) {
                let entries = std::mem::take(map);
                for (key, item) in entries {
                    let key = if key.contains(needle) {
                        changed += 1;
                        key.replace(needle, replacement)
                    } else {
                        key
                    };
                    map.insert(key, item);
                }
            }
            changed
                + map
                    .values_mut()
                    .map(|item| redact_value(item, needle, replacement))
                    .sum::<usize>()
        }
        _ => 0,
    }
}

/// Secret material for scrubbing outputs and errors; never leaves this module
async fn read_material(secrets: &SecretMounts) -> Vec<(String, String)> {
    let mut material = Vec::with_capacity(secrets.len());
    for mount in secrets.iter() {
        if let Ok(value) = tokio::fs::read_to_string(&mount.path).await {
            let value = value.trim().to_string();
            if !value.is_empty() {
                material.push((mount.name, value));
            }
        }
    }
    material
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{CapabilityDescriptor, CapabilityVersion};
    use crate::error::ErrorKind;
    use crate::invocation::CapabilityInvocation;
    use crate::secrets::FileSecretStore;
    use serde_json::json;

    fn runtime(root: &std::path::Path) -> ExecutionRuntime {
        ExecutionRuntime::new(Arc::new(FileSecretStore), root)
    }

    fn validated(descriptor: &CapabilityDescriptor, args: Value) -> ValidatedInvocation {
        let inv = CapabilityInvocation::new(
            descriptor.id(),
            args,
            ExecutionContext::new("shop", "prod", "alice"),
        );
        descriptor.validate_invocation(inv).unwrap()
    }

    #[tokio::test]
    async fn success_output_is_validated() {
        let root = tempfile::tempdir().unwrap();
        let descriptor = CapabilityDescriptor::builder("k8s.apply", CapabilityVersion::new(1, 0, 0))
            .output_schema(json!({
                "type": "object",
                "required": ["resourcesAffected"]
            }))
            .build()
            .unwrap();

        let mut handler = MockCapabilityHandler::new();
        handler.expect_run().times(1).returning(|_, _| Ok(json!({ "unexpected": true })));
        let capability = RegisteredCapability::new(descriptor.clone(), Arc::new(handler));

        let err = runtime(root.path())
            .execute(&capability, validated(&descriptor, json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationFailed);
        assert!(err.message.contains("output"));
    }

    #[tokio::test]
    async fn handler_failure_is_classified() {
        let root = tempfile::tempdir().unwrap();
        let descriptor = CapabilityDescriptor::builder("k8s.apply", CapabilityVersion::new(1, 0, 0))
            .build()
            .unwrap();

        let mut handler = MockCapabilityHandler::new();
        handler
            .expect_run()
            .returning(|_, _| Err(HandlerError::failed("connection refused")));
        let capability = RegisteredCapability::new(descriptor.clone(), Arc::new(handler));

        let err = runtime(root.path())
            .execute(&capability, validated(&descriptor, json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Retryable);
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn panic_becomes_runner_error() {
        let root = tempfile::tempdir().unwrap();
        let descriptor = CapabilityDescriptor::builder("k8s.apply", CapabilityVersion::new(1, 0, 0))
            .build()
            .unwrap();

        struct Panics;
        #[async_trait]
        impl CapabilityHandler for Panics {
            async fn run(&self, _: Value, _: SandboxContext) -> Result<Value, HandlerError> {
                panic!("boom");
            }
        }
        let capability = RegisteredCapability::new(descriptor.clone(), Arc::new(Panics));

        let err = runtime(root.path())
            .execute(&capability, validated(&descriptor, json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RunnerError);
        assert!(!err.message.contains("boom"));
    }

    #[tokio::test]
    async fn missing_secret_never_enters_handler() {
        let root = tempfile::tempdir().unwrap();
        let descriptor = CapabilityDescriptor::builder("k8s.apply", CapabilityVersion::new(1, 0, 0))
            .required_secrets(&["kubeconfig"])
            .build()
            .unwrap();

        let mut handler = MockCapabilityHandler::new();
        handler.expect_run().times(0);
        let capability = RegisteredCapability::new(descriptor.clone(), Arc::new(handler));

        let err = runtime(root.path())
            .execute(&capability, validated(&descriptor, json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingSecret);
    }

    #[test]
    fn redaction_walks_nested_values() {
        let mut value = json!({
            "debug": "token hunter2 accepted",
            "hunter2": 1,
            "attempts": [{ "header": "Bearer hunter2" }, 7, "clean"]
        });
        let changed = redact_value(&mut value, "hunter2", "[redacted:token]");
        assert_eq!(changed, 3);
        assert_eq!(
            value,
            json!({
                "debug": "token [redacted:token] accepted",
                "[redacted:token]": 1,
                "attempts": [{ "header": "Bearer [redacted:token]" }, 7, "clean"]
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_aborts_sandbox() {
        let root = tempfile::tempdir().unwrap();
        let descriptor = CapabilityDescriptor::builder("scan.run", CapabilityVersion::new(1, 0, 0))
            .timeout_secs(5)
            .classifier(|_| crate::error::Classification::Fatal)
            .build()
            .unwrap();

        struct Slow;
        #[async_trait]
        impl CapabilityHandler for Slow {
            async fn run(&self, _: Value, _: SandboxContext) -> Result<Value, HandlerError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!({}))
            }
        }
        let capability = RegisteredCapability::new(descriptor.clone(), Arc::new(Slow));

        let err = runtime(root.path())
            .execute(&capability, validated(&descriptor, json!({})))
            .await
            .unwrap_err();
        // the classifier only sees handler errors
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(err.retryable);
    }
}
