//! End-to-end tests: the Bridge driving real `stub-mcp-server` processes.

use std::time::{Duration, Instant};

use mcp_gateway::bridge::{Bridge, ErrorKind, ServiceRegistry, ServiceStatus, SessionOptions};
use mcp_gateway::config::{EnvBinding, ServiceDescriptor};
use serde_json::{json, Value};

const STUB: &str = env!("CARGO_BIN_EXE_stub-mcp-server");

fn options() -> SessionOptions {
    SessionOptions {
        handshake_timeout: Duration::from_secs(10),
        call_timeout: Duration::from_secs(10),
        stop_grace: Duration::from_millis(500),
    }
}

fn stub(name: &str) -> ServiceDescriptor {
    ServiceDescriptor {
        name: name.into(),
        display_name: Some(format!("Stub {name}")),
        description: "scripted MCP server".into(),
        command: Some(STUB.into()),
        ..Default::default()
    }
}

fn stub_with_init(name: &str, mode: &str) -> ServiceDescriptor {
    let mut descriptor = stub(name);
    descriptor.env.push(EnvBinding {
        name: "STUB_INIT".into(),
        value: Some(mode.into()),
        value_from: None,
    });
    descriptor
}

fn bridge(services: Vec<ServiceDescriptor>, options: SessionOptions) -> Bridge {
    Bridge::new(ServiceRegistry::new(services, None, options))
}

async fn wait_for_status(bridge: &Bridge, name: &str, status: ServiceStatus) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while bridge.get_service(name).await.unwrap().status != status {
        assert!(Instant::now() < deadline, "{name} never became {status}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_full_lifecycle_scenario() {
    let bridge = bridge(vec![stub("lifecycle")], options());

    let info = bridge.start_service("lifecycle").await.unwrap();
    assert_eq!(info.status, ServiceStatus::Running);
    assert_eq!(info.backend, Some("process"));

    let tools = bridge.list_tools("lifecycle").await.unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["t1", "echo"]);

    let result = bridge.call_tool("lifecycle", "t1", json!({})).await.unwrap();
    assert_eq!(
        result,
        json!({"content": [{"type": "text", "text": "t1 fixed payload"}]})
    );

    // The listing now reports live tools.
    let listed = bridge.get_service("lifecycle").await.unwrap();
    assert_eq!(listed.tools.len(), 2);
    assert_eq!(listed.display_name, "Stub lifecycle");

    bridge.stop_service("lifecycle").await.unwrap();
    let err = bridge.call_tool("lifecycle", "t1", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotRunning);
    assert_eq!(
        bridge.get_service("lifecycle").await.unwrap().status,
        ServiceStatus::Stopped
    );
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let bridge = bridge(vec![stub("once")], options());

    let (a, b) = tokio::join!(bridge.start_service("once"), bridge.start_service("once"));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.session_id, b.session_id);

    let again = bridge.start_service("once").await.unwrap();
    assert_eq!(again.session_id, a.session_id);
    assert_eq!(again.status, ServiceStatus::Running);

    bridge.stop_service("once").await.unwrap();
}

#[tokio::test]
async fn test_concurrent_calls_get_their_own_responses() {
    let bridge = bridge(vec![stub("fanout")], options());
    bridge.start_service("fanout").await.unwrap();

    // Earlier calls sleep longer, so responses arrive in reverse send order.
    let calls = (0..8u64).map(|tag| {
        let bridge = &bridge;
        async move {
            let args = json!({"ms": (8 - tag) * 30, "tag": tag});
            (tag, bridge.call_tool("fanout", "sleep", args).await)
        }
    });
    for (tag, outcome) in futures::future::join_all(calls).await {
        assert_eq!(outcome.unwrap(), json!({"tag": tag}));
    }

    bridge.stop_service("fanout").await.unwrap();
}

#[tokio::test]
async fn test_crash_fails_outstanding_calls() {
    let bridge = bridge(vec![stub("fragile")], options());
    bridge.start_service("fragile").await.unwrap();

    let slow = (0..3).map(|_| {
        bridge.call_tool("fragile", "sleep", json!({"ms": 5_000, "tag": "late"}))
    });
    let crash = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        bridge.call_tool("fragile", "crash", json!({})).await
    };
    let (outcomes, crashed) = tokio::join!(futures::future::join_all(slow), crash);

    for outcome in outcomes {
        assert_eq!(outcome.unwrap_err().kind(), ErrorKind::ProcessExited);
    }
    assert_eq!(crashed.unwrap_err().kind(), ErrorKind::ProcessExited);

    wait_for_status(&bridge, "fragile", ServiceStatus::Failed).await;
    let err = bridge.call_tool("fragile", "t1", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotRunning);
    assert!(bridge.get_service("fragile").await.unwrap().error.is_some());

    // An explicit start brings up a fresh session.
    let restarted = bridge.start_service("fragile").await.unwrap();
    assert_eq!(restarted.status, ServiceStatus::Running);
    assert!(bridge.call_tool("fragile", "t1", json!({})).await.is_ok());
    bridge.stop_service("fragile").await.unwrap();
}

#[tokio::test]
async fn test_stale_frames_are_discarded() {
    let bridge = bridge(vec![stub("stale")], options());
    bridge.start_service("stale").await.unwrap();

    let result = bridge.call_tool("stale", "stale", json!({})).await.unwrap();
    assert_eq!(result, json!({"stale": false}));
    assert!(bridge.call_tool("stale", "t1", json!({})).await.is_ok());

    bridge.stop_service("stale").await.unwrap();
}

#[tokio::test]
async fn test_echo_is_byte_identical() {
    let bridge = bridge(vec![stub("echo")], options());
    bridge.start_service("echo").await.unwrap();

    let result = bridge
        .call_tool("echo", "echo", json!({"a": 1, "b": "x"}))
        .await
        .unwrap();
    assert_eq!(serde_json::to_string(&result).unwrap(), r#"{"a":1,"b":"x"}"#);

    bridge.stop_service("echo").await.unwrap();
}

#[tokio::test]
async fn test_timeout_is_bounded_and_recoverable() {
    let bridge = bridge(vec![stub("slow")], options());
    bridge.start_service("slow").await.unwrap();

    let started = Instant::now();
    let err = bridge
        .call_tool_with_timeout("slow", "hang", json!({}), Duration::from_millis(50))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(elapsed >= Duration::from_millis(50), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(550), "returned late: {elapsed:?}");

    // The session is unaffected.
    assert!(bridge.call_tool("slow", "t1", json!({})).await.is_ok());
    bridge.stop_service("slow").await.unwrap();
}

#[tokio::test]
async fn test_remote_error_is_surfaced() {
    let bridge = bridge(vec![stub("strict")], options());
    bridge.start_service("strict").await.unwrap();

    let err = bridge
        .call_tool("strict", "does_not_exist", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoteError);
    assert!(err.to_string().contains("-32601"));

    bridge.stop_service("strict").await.unwrap();
}

#[tokio::test]
async fn test_silent_server_fails_handshake() {
    let quick = SessionOptions {
        handshake_timeout: Duration::from_millis(200),
        ..options()
    };
    let bridge = bridge(
        vec![
            stub_with_init("mute", "silent"),
            stub_with_init("garbled", "malformed"),
            stub_with_init("doomed", "crash"),
        ],
        quick,
    );

    for name in ["mute", "garbled", "doomed"] {
        let err = bridge.start_service(name).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HandshakeFailed, "{name}");
        assert_eq!(
            bridge.get_service(name).await.unwrap().status,
            ServiceStatus::Failed
        );
    }
}

#[tokio::test]
async fn test_launch_and_config_errors() {
    let mut missing = stub("missing");
    missing.command = Some("/nonexistent/stub-mcp-server".into());
    let bridge = bridge(vec![missing], options());

    let err = bridge.start_service("missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LaunchFailed);

    let err = bridge.start_service("unconfigured").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigMissing);
    assert_eq!(err.kind().http_status(), 404);
}

#[tokio::test]
async fn test_logs_capture_stderr() {
    let bridge = bridge(vec![stub("chatty")], options());
    bridge.start_service("chatty").await.unwrap();

    bridge
        .call_tool("chatty", "log", json!({"message": "hello from stub"}))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let logs = bridge.get_logs("chatty").await.unwrap();
        if logs.contains("hello from stub") {
            assert!(logs.contains("stub-mcp-server ready"));
            break;
        }
        assert!(Instant::now() < deadline, "stderr never captured: {logs:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    bridge.stop_service("chatty").await.unwrap();
}

#[tokio::test]
async fn test_stop_and_remove() {
    let bridge = bridge(vec![stub("temp")], options());
    bridge.start_service("temp").await.unwrap();

    bridge.stop_service("temp").await.unwrap();
    let err = bridge.stop_service("temp").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotRunning);

    bridge.start_service("temp").await.unwrap();
    bridge.remove_service("temp").await.unwrap();
    // Removing an already stopped service is fine.
    bridge.remove_service("temp").await.unwrap();

    let info = bridge.get_service("temp").await.unwrap();
    assert_eq!(info.status, ServiceStatus::Stopped);
    let err = bridge.call_tool("temp", "t1", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotRunning);
}

#[tokio::test]
async fn test_start_enabled_and_shutdown() {
    let mut disabled = stub("dormant");
    disabled.enabled = false;
    let bridge = bridge(vec![stub("alpha"), stub("beta"), disabled], options());

    let failures = bridge.start_enabled().await;
    assert!(failures.is_empty());

    let health = bridge.health().await;
    assert_eq!(health.services, 3);
    assert_eq!(health.running, 2);

    let statuses: Vec<(String, ServiceStatus)> = bridge
        .list_services()
        .await
        .into_iter()
        .map(|s| (s.name, s.status))
        .collect();
    assert_eq!(
        statuses,
        [
            ("alpha".to_string(), ServiceStatus::Running),
            ("beta".to_string(), ServiceStatus::Running),
            ("dormant".to_string(), ServiceStatus::Stopped),
        ]
    );

    bridge.shutdown().await;
    assert_eq!(bridge.health().await.running, 0);
    let err: Value = bridge
        .call_tool("alpha", "t1", json!({}))
        .await
        .map_err(|e| e.to_json())
        .unwrap_err();
    assert_eq!(err["kind"], "NotRunning");
}
