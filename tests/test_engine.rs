//! End-to-end tests for the session engine over an in-process duplex
//! transport: JSON-RPC dispatch, streaming, control, and teardown.

use execd::config::Config;
use execd::engine::SessionEngine;
use execd::estimator::TimeoutEstimator;
use execd::hooks::HookRunner;
use execd::monitor::ResourceMonitor;
use execd::process::ProcessManager;
use execd::session::SessionManager;
use execd::store::TimingStore;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

fn test_config() -> Config {
    Config {
        max_sessions: 10,
        session_timeout_secs: 3600,
        max_buffer_size: 8 * 1024 * 1024,
        max_line_ceiling: 16 * 1024 * 1024,
        chunk_size: 64 * 1024,
        allowed_commands: None,
        stream_timeout_secs: 600,
        enable_stream_timeout: false,
        default_timeout_secs: 300,
        ping_interval_secs: 30,
        ping_timeout_secs: 0,
        hooks_path: "/nonexistent/.execd-hooks.json".to_string(),
        allow_command_rewrite: false,
        timing_ttl_secs: 3600,
    }
}

fn build_engine(config: Config) -> SessionEngine {
    let store = TimingStore::new(Duration::from_secs(config.timing_ttl_secs));
    let monitor = ResourceMonitor::with_threshold(1e9);
    let estimator = TimeoutEstimator::new(store, monitor, config.default_timeout_secs);
    let hooks = HookRunner::load(&config.hooks_path);
    SessionEngine::new(
        config,
        SessionManager::new(10),
        ProcessManager::new(),
        hooks,
        estimator,
    )
}

/// A test client speaking line-framed JSON-RPC over a duplex pipe.
struct TestClient {
    lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>>,
    writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
}

async fn connect(engine: SessionEngine) -> TestClient {
    let (client, server) = tokio::io::duplex(1 << 20);
    tokio::spawn(async move {
        let (read, write) = tokio::io::split(server);
        engine.handle_connection(read, write).await;
    });

    let (read, write) = tokio::io::split(client);
    let mut client = TestClient {
        lines: BufReader::new(read).lines(),
        writer: write,
    };

    // Every connection starts with the `connected` notification.
    let connected = client.next().await;
    assert_eq!(connected["method"], "connected");
    client
}

impl TestClient {
    async fn send_raw(&mut self, frame: &str) {
        self.writer.write_all(frame.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn send(&mut self, value: Value) {
        self.send_raw(&value.to_string()).await;
    }

    /// Next non-keepalive message, with a generous timeout.
    async fn next(&mut self) -> Value {
        loop {
            let line = tokio::time::timeout(Duration::from_secs(30), self.lines.next_line())
                .await
                .expect("timed out waiting for message")
                .expect("transport error")
                .expect("connection closed");
            let value: Value = serde_json::from_str(&line).expect("invalid JSON from server");
            if value["method"] == "ping" {
                continue;
            }
            return value;
        }
    }

    /// Collect messages until one of the given notification methods arrives.
    async fn collect_until(&mut self, methods: &[&str]) -> Vec<Value> {
        let mut messages = Vec::new();
        loop {
            let value = self.next().await;
            let done = value
                .get("method")
                .and_then(Value::as_str)
                .is_some_and(|m| methods.contains(&m));
            messages.push(value);
            if done {
                return messages;
            }
        }
    }
}

fn find_method<'a>(messages: &'a [Value], method: &str) -> Option<&'a Value> {
    messages
        .iter()
        .find(|m| m.get("method").and_then(Value::as_str) == Some(method))
}

fn execute(command: &str, timeout: u64, id: u64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "execute",
        "params": {"command": command, "timeout": timeout},
        "id": id,
    })
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_echo_success_end_to_end() {
    let mut client = connect(build_engine(test_config())).await;
    // No timeout in the request: the estimator supplies one.
    client
        .send(json!({
            "jsonrpc": "2.0",
            "method": "execute",
            "params": {"command": "echo hello"},
            "id": 1,
        }))
        .await;

    let messages = client
        .collect_until(&["process.completed", "process.failed"])
        .await;

    // Response comes first, with the started status and a real pid.
    let response = &messages[0];
    assert_eq!(response["id"], 1);
    assert_eq!(response["result"]["status"], "started");
    assert!(response["result"]["pid"].as_u64().unwrap() > 0);

    // started precedes any output; completed is last.
    let started_idx = messages
        .iter()
        .position(|m| m["method"] == "process.started")
        .expect("process.started sent");
    let output_idx = messages
        .iter()
        .position(|m| m["method"] == "process.output")
        .expect("process.output sent");
    assert!(started_idx < output_idx);

    let output = find_method(&messages, "process.output").unwrap();
    assert_eq!(output["params"]["type"], "stdout");
    assert_eq!(output["params"]["data"], "hello\n");

    let completed = messages.last().unwrap();
    assert_eq!(completed["method"], "process.completed");
    assert_eq!(completed["params"]["exit_code"], 0);
    assert_eq!(completed["params"]["timed_out"], false);
    // The timeout error code only appears on timed-out executions.
    assert!(completed["params"].get("code").is_none());
}

#[tokio::test]
async fn test_immediate_exit_without_output() {
    let mut client = connect(build_engine(test_config())).await;
    client.send(execute("true", 30, 1)).await;

    let messages = client
        .collect_until(&["process.completed", "process.failed"])
        .await;

    assert!(find_method(&messages, "process.started").is_some());
    assert!(find_method(&messages, "process.output").is_none());
    let completed = messages.last().unwrap();
    assert_eq!(completed["method"], "process.completed");
    assert_eq!(completed["params"]["exit_code"], 0);
}

#[tokio::test]
async fn test_nonzero_exit_reports_failed() {
    let mut client = connect(build_engine(test_config())).await;
    client.send(execute("exit 5", 30, 1)).await;

    let messages = client
        .collect_until(&["process.completed", "process.failed"])
        .await;
    let terminal = messages.last().unwrap();
    assert_eq!(terminal["method"], "process.failed");
    assert_eq!(terminal["params"]["exit_code"], 5);
}

#[tokio::test]
async fn test_output_without_trailing_newline_delivered() {
    let mut client = connect(build_engine(test_config())).await;
    client.send(execute("printf 'no newline'", 30, 1)).await;

    let messages = client
        .collect_until(&["process.completed", "process.failed"])
        .await;
    let output = find_method(&messages, "process.output").expect("partial line delivered");
    assert_eq!(output["params"]["data"], "no newline");
    assert_eq!(messages.last().unwrap()["method"], "process.completed");
}

#[tokio::test]
async fn test_large_line_arrives_chunked() {
    let mut client = connect(build_engine(test_config())).await;
    // 100,000 bytes on one line: above the 64 KiB chunk limit.
    client
        .send(execute("head -c 100000 /dev/zero | tr '\\0' 'a'", 30, 1))
        .await;

    let messages = client
        .collect_until(&["process.completed", "process.failed"])
        .await;

    let chunks: Vec<&Value> = messages
        .iter()
        .filter(|m| m["method"] == "process.output")
        .collect();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0]["params"]["chunk_index"], 0);
    assert_eq!(chunks[0]["params"]["truncated"], true);
    assert_eq!(chunks[1]["params"]["chunk_index"], 1);
    assert!(chunks[1]["params"].get("truncated").is_none());

    let total: usize = chunks
        .iter()
        .map(|c| c["params"]["data"].as_str().unwrap().len())
        .sum();
    assert_eq!(total, 100_000);
    assert_eq!(messages.last().unwrap()["params"]["exit_code"], 0);
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_empty_command_rejected_as_invalid_params() {
    let mut client = connect(build_engine(test_config())).await;
    client.send(execute("", 30, 1)).await;

    let response = client.next().await;
    assert_eq!(response["id"], 1);
    assert_eq!(response["error"]["code"], -32602);
}

#[tokio::test]
async fn test_allow_list_blocks_other_commands() {
    let mut config = test_config();
    config.allowed_commands = Some(vec!["echo".to_string()]);
    let mut client = connect(build_engine(config)).await;

    client.send(execute("sleep 1", 30, 1)).await;
    let response = client.next().await;
    assert_eq!(response["error"]["code"], -32001);

    // Allowed prefix still works.
    client.send(execute("echo ok", 30, 2)).await;
    let messages = client
        .collect_until(&["process.completed", "process.failed"])
        .await;
    assert_eq!(messages.last().unwrap()["method"], "process.completed");
}

#[tokio::test]
async fn test_second_execute_while_running_is_rejected() {
    let mut client = connect(build_engine(test_config())).await;
    client.send(execute("sleep 10", 30, 1)).await;

    // Drain the started response + notification.
    let response = client.next().await;
    assert_eq!(response["result"]["status"], "started");
    let started = client.next().await;
    assert_eq!(started["method"], "process.started");

    client.send(execute("echo again", 30, 2)).await;
    let rejected = client.next().await;
    assert_eq!(rejected["id"], 2);
    assert_eq!(rejected["error"]["code"], -32602);

    // Clean up the running process.
    client
        .send(json!({"jsonrpc": "2.0", "method": "control", "params": {"type": "CANCEL"}, "id": 3}))
        .await;
    client
        .collect_until(&["process.completed", "process.failed"])
        .await;
}

#[tokio::test]
async fn test_unknown_method_rejected() {
    let mut client = connect(build_engine(test_config())).await;
    client
        .send(json!({"jsonrpc": "2.0", "method": "teleport", "params": {}, "id": 9}))
        .await;

    let response = client.next().await;
    assert_eq!(response["id"], 9);
    assert_eq!(response["error"]["code"], -32601);
}

#[tokio::test]
async fn test_invalid_json_yields_parse_error() {
    let mut client = connect(build_engine(test_config())).await;
    client.send_raw("this is not json").await;

    let response = client.next().await;
    assert_eq!(response["error"]["code"], -32700);
}

#[tokio::test]
async fn test_control_without_process_is_not_found() {
    let mut client = connect(build_engine(test_config())).await;
    client
        .send(json!({"jsonrpc": "2.0", "method": "control", "params": {"type": "PAUSE"}, "id": 1}))
        .await;

    let response = client.next().await;
    assert_eq!(response["error"]["code"], -32002);
}

// ---------------------------------------------------------------------------
// Control flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cancel_terminates_within_window() {
    let mut client = connect(build_engine(test_config())).await;
    client.send(execute("sleep 60", 120, 1)).await;
    client.next().await; // started response
    client.next().await; // process.started

    let cancel_sent = std::time::Instant::now();
    client
        .send(json!({"jsonrpc": "2.0", "method": "control", "params": {"type": "CANCEL"}, "id": 2}))
        .await;

    let messages = client
        .collect_until(&["process.completed", "process.failed"])
        .await;

    // Ack precedes the canceled notification, which precedes the terminal one.
    assert_eq!(messages[0]["id"], 2);
    assert_eq!(messages[0]["result"]["status"], "canceled");
    assert_eq!(messages[1]["method"], "process.canceled");

    let terminal = messages.last().unwrap();
    assert_eq!(terminal["method"], "process.failed");
    assert_eq!(terminal["params"]["exit_code"], -15); // SIGTERM
    assert!(cancel_sent.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_pause_and_resume_acknowledged_in_order() {
    let mut client = connect(build_engine(test_config())).await;
    client.send(execute("sleep 10", 30, 1)).await;
    client.next().await; // started response
    client.next().await; // process.started

    client
        .send(json!({"jsonrpc": "2.0", "method": "control", "params": {"type": "PAUSE"}, "id": 2}))
        .await;
    let ack = client.next().await;
    assert_eq!(ack["result"]["status"], "paused");
    let notified = client.next().await;
    assert_eq!(notified["method"], "process.paused");

    client
        .send(json!({"jsonrpc": "2.0", "method": "control", "params": {"type": "RESUME"}, "id": 3}))
        .await;
    let ack = client.next().await;
    assert_eq!(ack["result"]["status"], "resumed");
    let notified = client.next().await;
    assert_eq!(notified["method"], "process.resumed");

    client
        .send(json!({"jsonrpc": "2.0", "method": "control", "params": {"type": "CANCEL"}, "id": 4}))
        .await;
    client
        .collect_until(&["process.completed", "process.failed"])
        .await;
}

#[tokio::test]
async fn test_timeout_takes_termination_path() {
    let mut client = connect(build_engine(test_config())).await;
    client.send(execute("echo partial; sleep 30", 1, 1)).await;

    let messages = client
        .collect_until(&["process.completed", "process.failed"])
        .await;

    // Output produced before the timeout is preserved.
    let output = find_method(&messages, "process.output").expect("partial output kept");
    assert_eq!(output["params"]["data"], "partial\n");

    let terminal = messages.last().unwrap();
    assert_eq!(terminal["method"], "process.failed");
    assert_eq!(terminal["params"]["timed_out"], true);
    assert_eq!(terminal["params"]["code"], -32004);
}

// ---------------------------------------------------------------------------
// Inline events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_early_completion_marker_notification() {
    let mut client = connect(build_engine(test_config())).await;
    client
        .send(execute(
            "echo 'Task completed successfully'; sleep 1",
            30,
            1,
        ))
        .await;

    let messages = client
        .collect_until(&["process.completed", "process.failed"])
        .await;

    let early = find_method(&messages, "task.early_completion").expect("early completion sent");
    assert_eq!(early["params"]["marker"], "task completed successfully");
    assert!(early["params"]["elapsed_time"].as_f64().unwrap() < 1.0);

    let completed = messages.last().unwrap();
    assert_eq!(completed["method"], "process.completed");
    assert_eq!(completed["params"]["early_completion_detected"], true);
    assert_eq!(
        completed["params"]["completion_marker"],
        "task completed successfully"
    );
    assert!(completed["params"]["time_saved"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn test_token_limit_on_stderr_detected() {
    let mut client = connect(build_engine(test_config())).await;
    client
        .send(execute("echo 'token limit 32000' >&2; exit 3", 30, 1))
        .await;

    let messages = client
        .collect_until(&["process.completed", "process.failed"])
        .await;

    let event = find_method(&messages, "error.token_limit_exceeded").expect("token limit event");
    assert_eq!(event["params"]["code"], -32004);
    assert_eq!(event["params"]["limit"], 32000);
    assert_eq!(event["params"]["recoverable"], true);

    // The matching line is still delivered unchanged.
    let output = find_method(&messages, "process.output").unwrap();
    assert_eq!(output["params"]["type"], "stderr");
    assert_eq!(output["params"]["data"], "token limit 32000\n");

    let terminal = messages.last().unwrap();
    assert_eq!(terminal["method"], "process.failed");
    assert_eq!(terminal["params"]["exit_code"], 3);
}

// ---------------------------------------------------------------------------
// Sessions and teardown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_session_limit_rejected_synchronously() {
    let mut config = test_config();
    config.max_sessions = 1;
    let store = TimingStore::new(Duration::from_secs(3600));
    let estimator = TimeoutEstimator::new(store, ResourceMonitor::with_threshold(1e9), 300);
    let engine = SessionEngine::new(
        config,
        SessionManager::new(1),
        ProcessManager::new(),
        HookRunner::load("/nonexistent"),
        estimator,
    );

    let _first = connect(engine.clone()).await;

    // Second connection is rejected before any session state is created.
    let (client, server) = tokio::io::duplex(1 << 16);
    let engine2 = engine.clone();
    tokio::spawn(async move {
        let (read, write) = tokio::io::split(server);
        engine2.handle_connection(read, write).await;
    });
    let (read, _write) = tokio::io::split(client);
    let mut lines = BufReader::new(read).lines();
    let line = tokio::time::timeout(Duration::from_secs(10), lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .expect("rejection frame");
    let value: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(value["error"]["code"], -32003);
    assert_eq!(engine.sessions().len().await, 1);
}

#[tokio::test]
async fn test_disconnect_cancels_process_and_removes_session() {
    let engine = build_engine(test_config());
    let mut client = connect(engine.clone()).await;
    client.send(execute("sleep 60", 120, 1)).await;
    client.next().await; // started response
    client.next().await; // process.started

    drop(client);

    // Cleanup is the cancel path: session gone within the graceful window.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        if engine.sessions().is_empty().await {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "session not cleaned up after disconnect"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn test_hook_status_without_configuration() {
    let mut client = connect(build_engine(test_config())).await;
    client
        .send(json!({"jsonrpc": "2.0", "method": "hook_status", "params": {}, "id": 1}))
        .await;

    let response = client.next().await;
    assert_eq!(response["id"], 1);
    assert_eq!(response["result"]["enabled"], false);
    assert_eq!(response["result"]["hooks_configured"], json!([]));
}
