use super::*;
use crate::runtime::{ContainerSpec, Mount};
use crate::test_utils::{write_script, FakeRuntime};
use serde_json::json;
use std::path::Path;
use tempfile::tempdir;

async fn container_with_script(runtime: &FakeRuntime, code_dir: &Path, script: Value) -> String {
    write_script(code_dir, script);
    let spec = ContainerSpec {
        name: "probe".to_string(),
        image: "python:3.12-slim".to_string(),
        command: vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()],
        working_dir: None,
        env: Default::default(),
        labels: Default::default(),
        mounts: vec![Mount::read_only(code_dir.to_path_buf(), "/var/task")],
        memory_mb: Some(128),
    };
    let id = runtime.create(&spec).await.unwrap();
    runtime.start(&id).await.unwrap();
    id
}

fn request(payload: Value, timeout_ms: u64) -> InvocationRequest {
    InvocationRequest {
        request_id: "req-1".to_string(),
        payload,
        timeout: Duration::from_millis(timeout_ms),
    }
}

fn command() -> Vec<String> {
    vec!["python3".to_string(), "/var/runtime/bootstrap.py".to_string()]
}

fn handler(runtime: &FakeRuntime) -> ProtocolHandler {
    ProtocolHandler::new(Arc::new(runtime.clone()), Duration::from_millis(20))
}

#[tokio::test]
async fn test_success_returns_exact_payload() {
    let code = tempdir().unwrap();
    let runtime = FakeRuntime::new();
    let id = container_with_script(&runtime, code.path(), json!({"mode": "echo"})).await;

    let payload = json!({"x": 1, "nested": {"list": [1, 2.5, "three", null, true]}});
    let exchange = handler(&runtime)
        .exchange(&id, &command(), &request(payload.clone(), 1000))
        .await;
    assert!(exchange.healthy);
    assert_eq!(exchange.outcome.unwrap(), payload);
}

#[tokio::test]
async fn test_byte_by_byte_output_is_reassembled() {
    let code = tempdir().unwrap();
    let runtime = FakeRuntime::new();
    let id = container_with_script(
        &runtime,
        code.path(),
        json!({"mode": "respond", "value": {"ok": true}, "chunked": true, "log": "hello from handler"}),
    )
    .await;

    let exchange = handler(&runtime)
        .exchange(&id, &command(), &request(json!({}), 1000))
        .await;
    assert_eq!(exchange.outcome.unwrap(), json!({"ok": true}));
    assert!(exchange.logs.contains("hello from handler"));
}

#[tokio::test]
async fn test_request_id_reaches_the_sandbox() {
    let code = tempdir().unwrap();
    let runtime = FakeRuntime::new();
    let id = container_with_script(&runtime, code.path(), json!({"mode": "request-id"})).await;

    let exchange = handler(&runtime)
        .exchange(&id, &command(), &request(json!(null), 1000))
        .await;
    assert_eq!(exchange.outcome.unwrap(), json!("req-1"));
}

#[tokio::test]
async fn test_handler_error_keeps_sandbox_healthy() {
    let code = tempdir().unwrap();
    let runtime = FakeRuntime::new();
    let id = container_with_script(
        &runtime,
        code.path(),
        json!({"mode": "error", "error_type": "ValueError", "message": "bad input"}),
    )
    .await;

    let exchange = handler(&runtime)
        .exchange(&id, &command(), &request(json!({}), 1000))
        .await;
    assert!(exchange.healthy);
    match exchange.outcome {
        Err(InvocationError::HandlerError {
            error_type,
            message,
            stack_trace,
            ..
        }) => {
            assert_eq!(error_type, "ValueError");
            assert_eq!(message, "bad input");
            assert_eq!(stack_trace.len(), 1);
            assert!(!stack_trace[0].ends_with('\n'));
        }
        other => panic!("expected handler error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_deadline_yields_timeout_and_unhealthy() {
    let code = tempdir().unwrap();
    let runtime = FakeRuntime::new();
    let id = container_with_script(&runtime, code.path(), json!({"mode": "echo", "sleep_ms": 2000}))
        .await;

    let started = Instant::now();
    let exchange = handler(&runtime)
        .exchange(&id, &command(), &request(json!({}), 100))
        .await;
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert!(!exchange.healthy);
    assert_eq!(
        exchange.outcome,
        Err(InvocationError::InvocationTimeout {
            request_id: "req-1".to_string(),
            timeout_ms: 100
        })
    );
}

#[tokio::test]
async fn test_exit_without_response_is_crash_with_exit_code() {
    let code = tempdir().unwrap();
    let runtime = FakeRuntime::new();
    let id =
        container_with_script(&runtime, code.path(), json!({"mode": "crash", "exit_code": 139})).await;

    let exchange = handler(&runtime)
        .exchange(&id, &command(), &request(json!({}), 1000))
        .await;
    assert!(!exchange.healthy);
    match exchange.outcome {
        Err(InvocationError::SandboxCrash { exit_code, .. }) => assert_eq!(exit_code, Some(139)),
        other => panic!("expected crash, got {:?}", other),
    }
    assert!(exchange.logs.contains("fatal"));
}

#[tokio::test]
async fn test_truncated_frame_is_crash() {
    let code = tempdir().unwrap();
    let runtime = FakeRuntime::new();
    let id = container_with_script(&runtime, code.path(), json!({"mode": "partial"})).await;

    let exchange = handler(&runtime)
        .exchange(&id, &command(), &request(json!({}), 1000))
        .await;
    assert!(!exchange.healthy);
    match exchange.outcome {
        Err(InvocationError::SandboxCrash { detail, .. }) => assert!(detail.contains("truncated")),
        other => panic!("expected crash, got {:?}", other),
    }
}

#[tokio::test]
async fn test_exec_into_missing_container_is_crash() {
    let runtime = FakeRuntime::new();
    let exchange = handler(&runtime)
        .exchange("gone", &command(), &request(json!({}), 1000))
        .await;
    assert!(!exchange.healthy);
    assert!(matches!(
        exchange.outcome,
        Err(InvocationError::SandboxCrash { .. })
    ));
}

#[test]
fn test_handler_error_accepts_string_stack_trace() {
    let request = request(json!({}), 1000);
    let err = handler_error(
        &request,
        &json!({"errorMessage": "boom", "stackTrace": "at a\nat b"}),
    );
    assert_eq!(
        err,
        InvocationError::HandlerError {
            request_id: "req-1".to_string(),
            error_type: "Error".to_string(),
            message: "boom".to_string(),
            stack_trace: vec!["at a".to_string(), "at b".to_string()],
        }
    );
}
