//! Policy behavior of the execution runtime, exercised through public APIs

use serde_json::{json, Value};
use stagehand_capability::prelude::*;
use stagehand_capability::{Classification, SecretRef};
use stagehand_test_utils::{
    descriptor_with_retry, test_context, Call, CallLog, FnHandler, MemorySecretStore,
    RecordingSleep, ScriptedHandler, TEST_VERSION,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn runtime(store: MemorySecretStore, root: &std::path::Path) -> ExecutionRuntime {
    ExecutionRuntime::new(Arc::new(store), root)
}

#[tokio::test]
async fn invalid_args_never_reach_the_runtime() {
    let log = CallLog::new();
    let descriptor = CapabilityDescriptor::builder("k8s.apply_manifests", TEST_VERSION)
        .input_schema(json!({
            "type": "object",
            "properties": { "namespace": { "type": "string" } },
            "required": ["namespace"]
        }))
        .required_secrets(&["kubeconfig"])
        .build()
        .unwrap();
    let mut registry = CapabilityRegistry::new();
    registry
        .register(
            descriptor,
            Arc::new(FnHandler::returning("k8s.apply_manifests", &log, json!({}))),
        )
        .unwrap();
    let capability = registry.resolve("k8s.apply_manifests").unwrap();

    let context = test_context().with_secret_ref("kubeconfig", SecretRef::new("kube"));
    let invocation =
        CapabilityInvocation::new("k8s.apply_manifests", json!({ "namespace": 7 }), context);

    let err = capability
        .descriptor()
        .validate_invocation(invocation)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ValidationFailed);
    assert_eq!(err.violations[0].field, "/namespace");

    assert!(log.is_empty());
}

#[tokio::test]
async fn denied_host_makes_no_network_attempt() {
    let root = tempfile::tempdir().unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));
    let log = CallLog::new();

    let counter = Arc::clone(&attempts);
    let handler = FnHandler::new("http.fetch", &log, move |input: &Value, sandbox| {
        let url = input["url"].as_str().unwrap_or_default();
        sandbox.egress.authorize(url)?;
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "status": 200 }))
    });
    let descriptor = CapabilityDescriptor::builder("http.fetch", TEST_VERSION)
        .allow_outbound(["*.example.com"])
        .build()
        .unwrap();
    let mut registry = CapabilityRegistry::new();
    registry.register(descriptor, Arc::new(handler)).unwrap();
    let capability = registry.resolve("http.fetch").unwrap();
    let rt = runtime(MemorySecretStore::new(), root.path());

    let call = |url: &str| {
        CapabilityInvocation::new("http.fetch", json!({ "url": url }), test_context())
    };

    for denied in ["https://example.com/", "https://evil.net/x", "not a url"] {
        let validated = capability.descriptor().validate_invocation(call(denied)).unwrap();
        let err = rt.execute(capability, validated).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::OutboundHostNotAllowed, "{denied}");
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 0);

    let validated = capability
        .descriptor()
        .validate_invocation(call("https://api.example.com/v1"))
        .unwrap();
    assert_eq!(rt.execute(capability, validated).await.unwrap()["status"], 200);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retryable_error_is_attempted_three_times_with_backoff() {
    let root = tempfile::tempdir().unwrap();
    let scripted = ScriptedHandler::new(vec![
        Err(HandlerError::labelled("upstream flaked", "RETRYABLE")),
        Err(HandlerError::labelled("upstream flaked", "RETRYABLE")),
        Err(HandlerError::labelled("upstream flaked", "RETRYABLE")),
        Ok(json!({ "never": "reached" })),
    ]);
    let calls = scripted.counter();
    let mut registry = CapabilityRegistry::new();
    registry
        .register(
            descriptor_with_retry("flags.sync", RetryPolicy::new(3, 2.0, 2.0)),
            Arc::new(scripted),
        )
        .unwrap();
    let capability = registry.resolve("flags.sync").unwrap();
    let validated = capability
        .descriptor()
        .validate_invocation(CapabilityInvocation::new("flags.sync", json!({}), test_context()))
        .unwrap();
    let sleeper = RecordingSleep::new();

    let outcome = execute_with_retry(
        &runtime(MemorySecretStore::new(), root.path()),
        capability,
        &validated,
        &sleeper,
    )
    .await;

    assert_eq!(outcome.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.result.unwrap_err().kind, ErrorKind::Retryable);
    assert_eq!(
        sleeper.durations(),
        vec![Duration::from_secs(2), Duration::from_secs(4)]
    );
    assert_eq!(sleeper.attempts(), vec![1, 2]);
}

#[tokio::test]
async fn cancelled_retry_wait_stops_after_first_attempt() {
    let root = tempfile::tempdir().unwrap();
    let scripted = ScriptedHandler::new(vec![Err(HandlerError::failed("connection reset"))])
        .with_fallback(json!({ "never": "reached" }));
    let calls = scripted.counter();
    let mut registry = CapabilityRegistry::new();
    registry
        .register(
            descriptor_with_retry("flags.sync", RetryPolicy::new(3, 2.0, 2.0)),
            Arc::new(scripted),
        )
        .unwrap();
    let capability = registry.resolve("flags.sync").unwrap();
    let validated = capability
        .descriptor()
        .validate_invocation(CapabilityInvocation::new("flags.sync", json!({}), test_context()))
        .unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let sleeper = RecordingSleep::cancellable(cancel);

    let outcome = execute_with_retry(
        &runtime(MemorySecretStore::new(), root.path()),
        capability,
        &validated,
        &sleeper,
    )
    .await;

    assert_eq!(outcome.attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.result.unwrap_err().kind, ErrorKind::Cancelled);
    assert_eq!(sleeper.attempts(), vec![1]);
}

#[tokio::test]
async fn fatal_error_is_not_retried() {
    let root = tempfile::tempdir().unwrap();
    let scripted = ScriptedHandler::new(vec![Err(HandlerError::failed("manifest rejected"))]);
    let calls = scripted.counter();
    let mut registry = CapabilityRegistry::new();
    registry
        .register(
            descriptor_with_retry("k8s.apply_manifests", RetryPolicy::new(5, 1.0, 2.0)),
            Arc::new(scripted),
        )
        .unwrap();
    let capability = registry.resolve("k8s.apply_manifests").unwrap();
    let validated = capability
        .descriptor()
        .validate_invocation(CapabilityInvocation::new(
            "k8s.apply_manifests",
            json!({}),
            test_context(),
        ))
        .unwrap();
    let sleeper = RecordingSleep::new();

    let outcome = execute_with_retry(
        &runtime(MemorySecretStore::new(), root.path()),
        capability,
        &validated,
        &sleeper,
    )
    .await;

    assert_eq!(outcome.attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.result.unwrap_err().kind, ErrorKind::Fatal);
    assert!(sleeper.durations().is_empty());
}

#[tokio::test]
async fn transient_then_success_recovers() {
    let root = tempfile::tempdir().unwrap();
    let scripted = ScriptedHandler::new(vec![Err(HandlerError::failed("connection reset"))])
        .with_fallback(json!({ "ok": true }));
    let mut registry = CapabilityRegistry::new();
    registry
        .register(
            CapabilityDescriptor::builder("worker.drain_status", TEST_VERSION)
                .classifier(|_| Classification::Retryable)
                .build()
                .unwrap(),
            Arc::new(scripted),
        )
        .unwrap();
    let capability = registry.resolve("worker.drain_status").unwrap();
    let validated = capability
        .descriptor()
        .validate_invocation(CapabilityInvocation::new(
            "worker.drain_status",
            json!({}),
            test_context(),
        ))
        .unwrap();

    let outcome = execute_with_retry(
        &runtime(MemorySecretStore::new(), root.path()),
        capability,
        &validated,
        &RecordingSleep::new(),
    )
    .await;
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.result.unwrap(), json!({ "ok": true }));
}

#[tokio::test]
async fn secret_values_never_leave_in_errors() {
    let root = tempfile::tempdir().unwrap();
    let log = CallLog::new();
    let handler = FnHandler::new("registry.push", &log, |_, sandbox| {
        let path = sandbox.secrets.path("token").expect("token mounted");
        let token = std::fs::read_to_string(path).unwrap();
        Err(HandlerError::failed(format!("registry refused token {token}")))
    });
    let descriptor = CapabilityDescriptor::builder("registry.push", TEST_VERSION)
        .required_secrets(&["token"])
        .retry_policy(RetryPolicy::no_retry())
        .build()
        .unwrap();
    let mut registry = CapabilityRegistry::new();
    registry.register(descriptor, Arc::new(handler)).unwrap();
    let capability = registry.resolve("registry.push").unwrap();

    let store = MemorySecretStore::new().with_secret("vault/registry", "hunter2-s3cr3t");
    let context = test_context().with_secret_ref("token", SecretRef::new("vault/registry"));
    let validated = capability
        .descriptor()
        .validate_invocation(CapabilityInvocation::new("registry.push", json!({}), context))
        .unwrap();

    let err = runtime(store, root.path())
        .execute(capability, validated)
        .await
        .unwrap_err();

    assert!(!err.message.contains("hunter2-s3cr3t"));
    assert!(err.message.contains("[redacted:token]"));
    let serialized = serde_json::to_string(&err).unwrap();
    assert!(!serialized.contains("hunter2-s3cr3t"));
    // scope directory is gone after the call
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn secret_values_never_leave_in_outputs() {
    let root = tempfile::tempdir().unwrap();
    let log = CallLog::new();
    let handler = FnHandler::new("registry.login", &log, |_, sandbox| {
        let path = sandbox.secrets.path("token").expect("token mounted");
        let token = std::fs::read_to_string(path).unwrap();
        Ok(json!({
            "debug": format!("authenticated with {token}"),
            "headers": [{ "authorization": format!("Bearer {token}") }],
            "status": 200
        }))
    });
    let descriptor = CapabilityDescriptor::builder("registry.login", TEST_VERSION)
        .required_secrets(&["token"])
        .build()
        .unwrap();
    let mut registry = CapabilityRegistry::new();
    registry.register(descriptor, Arc::new(handler)).unwrap();
    let capability = registry.resolve("registry.login").unwrap();

    let store = MemorySecretStore::new().with_secret("vault/registry", "hunter2-s3cr3t");
    let context = test_context().with_secret_ref("token", SecretRef::new("vault/registry"));
    let validated = capability
        .descriptor()
        .validate_invocation(CapabilityInvocation::new(
            "registry.login",
            json!({ "registry": "registry.example.com" }),
            context,
        ))
        .unwrap();

    let output = runtime(store, root.path())
        .execute(capability, validated)
        .await
        .unwrap();

    assert_eq!(
        output,
        json!({
            "debug": "authenticated with [redacted:token]",
            "headers": [{ "authorization": "Bearer [redacted:token]" }],
            "status": 200
        })
    );
    assert!(!serde_json::to_string(&output).unwrap().contains("hunter2-s3cr3t"));
    assert_eq!(
        log.calls(),
        vec![Call {
            cap_id: "registry.login".into(),
            input: json!({ "registry": "registry.example.com" }),
        }]
    );
}

#[tokio::test]
async fn missing_secret_reference_fails_closed() {
    let root = tempfile::tempdir().unwrap();
    let log = CallLog::new();
    let descriptor = CapabilityDescriptor::builder("registry.push", TEST_VERSION)
        .required_secrets(&["token"])
        .build()
        .unwrap();
    let mut registry = CapabilityRegistry::new();
    registry
        .register(
            descriptor,
            Arc::new(FnHandler::returning("registry.push", &log, json!({}))),
        )
        .unwrap();
    let capability = registry.resolve("registry.push").unwrap();
    let validated = capability
        .descriptor()
        .validate_invocation(CapabilityInvocation::new(
            "registry.push",
            json!({}),
            test_context(),
        ))
        .unwrap();

    let err = runtime(MemorySecretStore::new(), root.path())
        .execute(capability, validated)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::MissingSecret);
    assert!(log.is_empty());
}
