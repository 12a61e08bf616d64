//! Blueprints: named, typed saga programs
//!
//! A [`Blueprint`] is written against typed input and output. The
//! [`BlueprintRegistry`] erases those types so blueprints can be started by
//! id with JSON input, e.g. from the tool surface.

use crate::error::{SagaError, SagaFailure};
use crate::orchestrator::{Orchestrator, RunOptions, RunReport};
use crate::saga::Saga;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A saga program
#[async_trait]
pub trait Blueprint: Send + Sync {
    /// Typed input, stored with the run for replay
    type Input: Serialize + DeserializeOwned + JsonSchema + Send + Sync + 'static;
    /// Typed output
    type Output: Serialize + Send + 'static;

    /// Stable id
    fn id(&self) -> &'static str;

    /// JSON Schema of [`Blueprint::Input`]
    fn input_schema(&self) -> Value {
        serde_json::to_value(schemars::schema_for!(Self::Input)).unwrap_or(Value::Bool(true))
    }

    /// Forward logic
    ///
    /// Returning `Err` unwinds every compensation registered so far.
    async fn run(&self, saga: &mut Saga, input: Self::Input) -> Result<Self::Output, SagaError>;
}

/// Type-erased blueprint
#[async_trait]
pub trait DynBlueprint: Send + Sync {
    /// Stable id
    fn blueprint_id(&self) -> &'static str;

    /// JSON Schema of the input
    fn schema(&self) -> Value;

    /// Start a run from JSON input
    async fn start_json(
        &self,
        orchestrator: &Orchestrator,
        input: Value,
        options: RunOptions,
    ) -> Result<RunReport<Value>, SagaFailure>;
}

#[async_trait]
impl<B: Blueprint + 'static> DynBlueprint for B {
    fn blueprint_id(&self) -> &'static str {
        self.id()
    }

    fn schema(&self) -> Value {
        self.input_schema()
    }

    async fn start_json(
        &self,
        orchestrator: &Orchestrator,
        input: Value,
        options: RunOptions,
    ) -> Result<RunReport<Value>, SagaFailure> {
        let input: B::Input = serde_json::from_value(input)
            .map_err(|e| SagaFailure::before_start(SagaError::InvalidInput(e.to_string())))?;
        let report = orchestrator.start(self, input, options).await?;
        let output = serde_json::to_value(&report.output).map_err(|e| SagaFailure {
            run_id: Some(report.run_id),
            error: SagaError::OutputDecode {
                cap_id: self.id().to_string(),
                reason: e.to_string(),
            },
            history: report.history.clone(),
        })?;
        Ok(RunReport {
            run_id: report.run_id,
            output,
            history: report.history,
        })
    }
}

/// Blueprints by id
#[derive(Clone, Default)]
pub struct BlueprintRegistry {
    blueprints: BTreeMap<&'static str, Arc<dyn DynBlueprint>>,
}

impl std::fmt::Debug for BlueprintRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.blueprints.keys()).finish()
    }
}

impl BlueprintRegistry {
    /// Create new empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in blueprints
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(crate::blueprints::BlueGreenDeploy);
        registry.register(crate::blueprints::ProgressiveRollout);
        registry
    }

    /// Register a blueprint, replacing any with the same id
    pub fn register<B: Blueprint + 'static>(&mut self, blueprint: B) {
        self.blueprints.insert(blueprint.id(), Arc::new(blueprint));
    }

    /// Look up by id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn DynBlueprint>> {
        self.blueprints.get(id).cloned()
    }

    /// Registered ids, sorted
    #[must_use]
    pub fn ids(&self) -> Vec<&'static str> {
        self.blueprints.keys().copied().collect()
    }

    /// Get number of registered blueprints
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.blueprints.len()
    }

    /// Check if registry is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blueprints.is_empty()
    }
}
