//! Testing utilities for the Stagehand workspace
//!
//! Scripted handlers, call logs, recording sleeps and an in-memory secret
//! store.

#![allow(missing_docs)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use stagehand_capability::{
    CapabilityDescriptor, CapabilityError, CapabilityHandler, CapabilityRegistry,
    CapabilityVersion, DurableSleep, ExecutionContext, HandlerError, RetryPolicy,
    SandboxContext, SecretRef, SecretStore, SecretStoreError,
};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const TEST_VERSION: CapabilityVersion = CapabilityVersion::new(1, 0, 0);

/// One recorded handler call
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub cap_id: String,
    pub input: Value,
}

/// Ordered log shared across handlers
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, cap_id: &str, input: Value) {
        self.calls.lock().push(Call {
            cap_id: cap_id.to_string(),
            input,
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn ids(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.cap_id.clone()).collect()
    }

    pub fn count(&self, cap_id: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.cap_id == cap_id).count()
    }

    pub fn inputs(&self, cap_id: &str) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.cap_id == cap_id)
            .map(|c| c.input.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }
}

type Respond = dyn Fn(&Value, &SandboxContext) -> Result<Value, HandlerError> + Send + Sync;

/// Handler that logs every call and answers with a closure
pub struct FnHandler {
    cap_id: String,
    log: CallLog,
    respond: Box<Respond>,
}

impl FnHandler {
    pub fn new<F>(cap_id: &str, log: &CallLog, respond: F) -> Self
    where
        F: Fn(&Value, &SandboxContext) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        Self {
            cap_id: cap_id.to_string(),
            log: log.clone(),
            respond: Box::new(respond),
        }
    }

    /// Always answer `output`
    pub fn returning(cap_id: &str, log: &CallLog, output: Value) -> Self {
        Self::new(cap_id, log, move |_, _| Ok(output.clone()))
    }

    /// Always fail with `message`
    pub fn failing(cap_id: &str, log: &CallLog, message: &str) -> Self {
        let message = message.to_string();
        Self::new(cap_id, log, move |_, _| Err(HandlerError::failed(message.clone())))
    }
}

#[async_trait]
impl CapabilityHandler for FnHandler {
    async fn run(&self, input: Value, sandbox: SandboxContext) -> Result<Value, HandlerError> {
        self.log.record(&self.cap_id, input.clone());
        (self.respond)(&input, &sandbox)
    }
}

/// Handler replaying a fixed queue of responses, then `fallback`
pub struct ScriptedHandler {
    responses: Mutex<VecDeque<Result<Value, HandlerError>>>,
    fallback: Value,
    calls: Arc<AtomicUsize>,
}

impl ScriptedHandler {
    pub fn new(responses: Vec<Result<Value, HandlerError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            fallback: json!({}),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_fallback(mut self, fallback: Value) -> Self {
        self.fallback = fallback;
        self
    }

    /// Shared call counter, readable after the handler moved into a registry
    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl CapabilityHandler for ScriptedHandler {
    async fn run(&self, _input: Value, _sandbox: SandboxContext) -> Result<Value, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.responses.lock().pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

/// Sleep that returns immediately and records what was asked
#[derive(Debug, Clone, Default)]
pub struct RecordingSleep {
    waits: Arc<Mutex<Vec<(u32, Duration)>>>,
    cancel: CancellationToken,
}

impl RecordingSleep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancellable(cancel: CancellationToken) -> Self {
        Self {
            waits: Arc::default(),
            cancel,
        }
    }

    pub fn durations(&self) -> Vec<Duration> {
        self.waits.lock().iter().map(|(_, d)| *d).collect()
    }

    pub fn attempts(&self) -> Vec<u32> {
        self.waits.lock().iter().map(|(a, _)| *a).collect()
    }
}

#[async_trait]
impl DurableSleep for RecordingSleep {
    async fn sleep(&self, attempt: u32, duration: Duration) -> Result<(), CapabilityError> {
        self.waits.lock().push((attempt, duration));
        if self.cancel.is_cancelled() {
            return Err(CapabilityError::cancelled("retry wait"));
        }
        Ok(())
    }
}

/// Secret store holding material in memory; references are keys
#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
    values: HashMap<String, String>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, reference: &str, value: &str) -> Self {
        self.values.insert(reference.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn materialize(
        &self,
        reference: &SecretRef,
        target: &Path,
    ) -> Result<(), SecretStoreError> {
        let value = self
            .values
            .get(reference.as_str())
            .ok_or_else(|| SecretStoreError::NotFound(reference.to_string()))?;
        tokio::fs::write(target, value).await?;
        Ok(())
    }
}

/// Descriptor with permissive schemas and no retries
pub fn permissive_descriptor(id: &str) -> CapabilityDescriptor {
    CapabilityDescriptor::builder(id, TEST_VERSION)
        .retry_policy(RetryPolicy::no_retry())
        .build()
        .unwrap()
}

/// Descriptor with permissive schemas and the given retry policy
pub fn descriptor_with_retry(id: &str, policy: RetryPolicy) -> CapabilityDescriptor {
    CapabilityDescriptor::builder(id, TEST_VERSION)
        .retry_policy(policy)
        .build()
        .unwrap()
}

/// Context for app `shop` in `staging`
pub fn test_context() -> ExecutionContext {
    ExecutionContext::new("shop", "staging", "test-runner").with_trace_id("trace-test")
}

/// Registry of permissive capabilities answering `{}` and logging to `log`
pub fn registry_with(ids: &[&str], log: &CallLog) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    for id in ids {
        registry
            .register(
                permissive_descriptor(id),
                Arc::new(FnHandler::returning(id, log, json!({}))),
            )
            .unwrap();
    }
    registry
}
