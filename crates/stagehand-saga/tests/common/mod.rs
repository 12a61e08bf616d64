//! Shared harness for the saga integration suites

#![allow(dead_code)]

use serde_json::Value;
use stagehand_capability::{CapabilityHandler, CapabilityRegistry};
use stagehand_saga::{InMemorySubstrate, Orchestrator, OrchestratorConfig, RunOptions, Substrate};
use stagehand_test_utils::{permissive_descriptor, test_context, CallLog, FnHandler, MemorySecretStore};
use std::sync::Arc;

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub substrate: Arc<InMemorySubstrate>,
}

pub fn harness(registry: CapabilityRegistry) -> Harness {
    harness_with(OrchestratorConfig::new(), registry)
}

pub fn harness_with(config: OrchestratorConfig, registry: CapabilityRegistry) -> Harness {
    let config = config.with_secret_mount_root(std::env::temp_dir().join("stagehand-saga-tests"));
    let substrate = Arc::new(InMemorySubstrate::new());
    let orchestrator = Orchestrator::new(
        config,
        Arc::new(registry),
        Arc::clone(&substrate) as Arc<dyn Substrate>,
        Arc::new(MemorySecretStore::new()),
    );
    Harness {
        orchestrator,
        substrate,
    }
}

pub fn options() -> RunOptions {
    RunOptions::new(test_context())
}

/// Register `id` with a permissive descriptor and no retries
pub fn register(registry: &mut CapabilityRegistry, id: &str, handler: impl CapabilityHandler + 'static) {
    registry
        .register(permissive_descriptor(id), Arc::new(handler))
        .unwrap();
}

/// Register `id` answering `output`
pub fn returning(registry: &mut CapabilityRegistry, log: &CallLog, id: &str, output: Value) {
    register(registry, id, FnHandler::returning(id, log, output));
}

/// Register `id` failing with a fatal error
pub fn failing(registry: &mut CapabilityRegistry, log: &CallLog, id: &str) {
    register(registry, id, FnHandler::failing(id, log, "permission denied"));
}
