//! Simulated capabilities backing the built-in blueprints
//!
//! Each handler answers with plausible output and logs the call. Rollout
//! metrics degrade once the flag percentage reaches `breach_at`, and the
//! previous build drains after `drain_after_polls` polls.

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use stagehand_capability::{
    CapabilityDescriptor, CapabilityHandler, CapabilityRegistry, CapabilityVersion,
    HandlerError, RetryPolicy, SandboxContext,
};
use stagehand_saga::blueprints::{blue_green, rollout};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

const VERSION: CapabilityVersion = CapabilityVersion::new(1, 0, 0);

/// Knobs of the simulated environment
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Simulation {
    pub(crate) breach_at: Option<u8>,
    pub(crate) drain_after_polls: u32,
}

type Respond = dyn Fn(&Value) -> Result<Value, HandlerError> + Send + Sync;

struct Simulated {
    cap_id: &'static str,
    respond: Box<Respond>,
}

impl Simulated {
    fn new<F>(cap_id: &'static str, respond: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        Self {
            cap_id,
            respond: Box::new(respond),
        }
    }

    fn ok(cap_id: &'static str) -> Self {
        Self::new(cap_id, |_| Ok(json!({})))
    }
}

#[async_trait]
impl CapabilityHandler for Simulated {
    async fn run(&self, input: Value, sandbox: SandboxContext) -> Result<Value, HandlerError> {
        tracing::info!(
            cap_id = self.cap_id,
            trace_id = %sandbox.context.trace_id,
            secrets = sandbox.secrets.len(),
            "simulated call"
        );
        (self.respond)(&input)
    }
}

fn string_field<'a>(input: &'a Value, field: &str) -> Result<&'a str, HandlerError> {
    input[field]
        .as_str()
        .ok_or_else(|| HandlerError::failed(format!("`{field}` is not a string")))
}

fn descriptor(id: &str) -> anyhow::Result<CapabilityDescriptor> {
    CapabilityDescriptor::builder(id, VERSION)
        .retry_policy(RetryPolicy::new(3, 2.0, 2.0))
        .build()
        .with_context(|| format!("descriptor for {id}"))
}

/// Registry answering every capability the built-in blueprints use
pub(crate) fn registry(simulation: Simulation) -> anyhow::Result<CapabilityRegistry> {
    let percentage = Arc::new(AtomicU64::new(0));
    let polls = Arc::new(AtomicU32::new(0));
    let mut registry = CapabilityRegistry::new();

    let build = CapabilityDescriptor::builder(blue_green::caps::BUILD_AND_PUSH, VERSION)
        .input_schema(json!({
            "type": "object",
            "properties": {
                "repository": { "type": "string" },
                "tag": { "type": "string" },
                "contextDir": { "type": "string" }
            },
            "required": ["repository", "tag"]
        }))
        .output_schema(json!({
            "type": "object",
            "properties": { "imageRef": { "type": "string" } },
            "required": ["imageRef"]
        }))
        .secrets_schema(json!({
            "type": "object",
            "properties": { "registry_token": { "type": "string" } }
        }))
        .allow_outbound(["*.example.com"])
        .idempotent(false)
        .retry_policy(RetryPolicy::new(3, 2.0, 2.0))
        .build()
        .context("build descriptor")?;

    let handlers: Vec<(CapabilityDescriptor, Simulated)> = vec![
        (
            build,
            Simulated::new(blue_green::caps::BUILD_AND_PUSH, |input| {
                let repository = string_field(input, "repository")?;
                let tag = string_field(input, "tag")?;
                Ok(json!({
                    "imageRef": format!("{repository}:{tag}"),
                    "digest": format!("sha256:{:0>64}", tag.len()),
                }))
            }),
        ),
        (
            descriptor(blue_green::caps::GENERATE_RELEASE_FLAG)?,
            Simulated::new(blue_green::caps::GENERATE_RELEASE_FLAG, |input| {
                Ok(json!({ "flagKey": string_field(input, "key")? }))
            }),
        ),
        (
            descriptor(blue_green::caps::SYNC_FLAGS)?,
            Simulated::ok(blue_green::caps::SYNC_FLAGS),
        ),
        (
            descriptor(blue_green::caps::ROLLBACK_FLAG)?,
            Simulated::ok(blue_green::caps::ROLLBACK_FLAG),
        ),
        (
            descriptor(blue_green::caps::APPLY_MANIFESTS)?,
            Simulated::new(blue_green::caps::APPLY_MANIFESTS, |input| {
                let resources: Vec<String> = input["manifests"]
                    .as_array()
                    .map(|paths| {
                        paths
                            .iter()
                            .filter_map(Value::as_str)
                            .map(|p| format!("applied/{p}"))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(json!({ "resourcesAffected": resources }))
            }),
        ),
        (
            descriptor(blue_green::caps::ROLLOUT_RESTART)?,
            Simulated::ok(blue_green::caps::ROLLOUT_RESTART),
        ),
        (
            descriptor(blue_green::caps::SET_DEFAULT_BUILD)?,
            Simulated::ok(blue_green::caps::SET_DEFAULT_BUILD),
        ),
        (
            descriptor(blue_green::caps::DRAIN_STATUS)?,
            Simulated::new(blue_green::caps::DRAIN_STATUS, move |_| {
                let seen = polls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(json!({ "drained": (seen > simulation.drain_after_polls) }))
            }),
        ),
        (
            descriptor(rollout::caps::SET_PERCENTAGE)?,
            Simulated::new(rollout::caps::SET_PERCENTAGE, {
                let percentage = Arc::clone(&percentage);
                move |input: &Value| {
                    let value = input["percentage"]
                        .as_u64()
                        .ok_or_else(|| HandlerError::failed("`percentage` is not a number"))?;
                    percentage.store(value, Ordering::SeqCst);
                    Ok(json!({}))
                }
            }),
        ),
        (
            descriptor(rollout::caps::DISABLE_FLAG)?,
            Simulated::ok(rollout::caps::DISABLE_FLAG),
        ),
        (
            descriptor(rollout::caps::SET_MESH_WEIGHTS)?,
            Simulated::ok(rollout::caps::SET_MESH_WEIGHTS),
        ),
        (
            descriptor(rollout::caps::COMPARE_METRICS)?,
            Simulated::new(rollout::caps::COMPARE_METRICS, move |_| {
                let current = percentage.load(Ordering::SeqCst);
                let breached = simulation
                    .breach_at
                    .is_some_and(|at| current >= u64::from(at));
                let canary_error_rate = if breached { 0.25 } else { 0.011 };
                Ok(json!({
                    "baseline": { "errorRate": 0.01, "p95LatencyMs": 120.0, "requestCount": 10_000 },
                    "canary": {
                        "errorRate": canary_error_rate,
                        "p95LatencyMs": 124.0,
                        "requestCount": current * 100
                    }
                }))
            }),
        ),
    ];

    for (descriptor, handler) in handlers {
        registry
            .register(descriptor, Arc::new(handler))
            .context("register simulated capability")?;
    }
    Ok(registry)
}
