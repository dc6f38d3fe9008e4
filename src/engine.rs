//! Per-connection state machine: JSON-RPC dispatch, execution orchestration,
//! streaming, and teardown.
//!
//! The engine consumes parsed frames from a [`Connection`] and emits
//! serializable values onto the session's outbound queue; it knows nothing
//! about the hosting transport. Each execution runs as a background task
//! that owns the child process: two stream readers and the exit waiter run
//! under a single timeout, and every terminal path funnels into one
//! completion notification.

use crate::config::{
    self, Config, ERROR_INVALID_PARAMS, ERROR_METHOD_NOT_FOUND, ERROR_PARSE_ERROR,
    ERROR_SESSION_LIMIT, READER_DRAIN_GRACE,
};
use crate::estimator::TimeoutEstimator;
use crate::hooks::{self, HookRunner};
use crate::process::{self, ProcessManager};
use crate::protocol::{
    self, CompletionUpdate, ConnectionInfo, ControlKind, ControlParams, ExecuteParams, Request,
    StatusUpdate, StreamKind,
};
use crate::session::{SessionManager, SessionState};
use crate::stream::{self, MuxEvent, StreamMultiplexer};
use crate::transport::Connection;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};

/// Bound on waiting for the child after its streams reach EOF.
const EXIT_WAIT_AFTER_EOF: Duration = Duration::from_secs(5);

/// Output sample retained for post-execution hooks: first 100 lines, 1 KiB each.
const SAMPLE_MAX_LINES: usize = 100;
const SAMPLE_MAX_LINE_BYTES: usize = 1000;

/// How one execution ended.
#[derive(Debug)]
enum RunOutcome {
    /// Streams closed and the child was reaped.
    Exited(Option<i32>),
    /// The planned timeout elapsed first.
    TimedOut,
    /// A cancel was requested (control message or disconnect).
    Canceled,
}

/// Early-completion bookkeeping for one execution.
#[derive(Debug, Default)]
struct EarlyCompletion {
    elapsed_secs: Option<f64>,
    marker: Option<String>,
}

/// The session engine. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct SessionEngine {
    config: std::sync::Arc<Config>,
    sessions: SessionManager,
    processes: ProcessManager,
    hooks: HookRunner,
    estimator: TimeoutEstimator,
}

impl SessionEngine {
    #[must_use]
    pub fn new(
        config: Config,
        sessions: SessionManager,
        processes: ProcessManager,
        hooks: HookRunner,
        estimator: TimeoutEstimator,
    ) -> Self {
        Self {
            config: std::sync::Arc::new(config),
            sessions,
            processes,
            hooks,
            estimator,
        }
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Serve one client connection until disconnect.
    pub async fn handle_connection<R, W>(&self, read: R, write: W)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut conn = Connection::new(read, write);
        let outbound = conn.sender();

        if !self.sessions.create(&session_id, outbound.clone()).await {
            let _ = outbound.send(protocol::error_response(
                ERROR_SESSION_LIMIT,
                "Session limit exceeded",
                None,
            )).await;
            conn.shutdown().await;
            return;
        }

        tracing::info!(session = %session_id, "connection accepted");
        let _ = outbound.send(protocol::notification(
            "connected",
            ConnectionInfo::new(session_id.clone()),
        )).await;

        let mut ping = tokio::time::interval(Duration::from_secs(
            self.config.ping_interval_secs.max(1),
        ));
        ping.tick().await;
        let ping_timeout = self.config.ping_timeout_secs;
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                frame = conn.next_frame() => {
                    match frame {
                        Some(frame) => {
                            last_inbound = Instant::now();
                            self.handle_frame(&session_id, &frame, &outbound).await;
                        }
                        None => {
                            tracing::info!(session = %session_id, "client disconnected");
                            break;
                        }
                    }
                }
                _ = ping.tick() => {
                    let _ = outbound.send(protocol::notification("ping", serde_json::json!({}))).await;
                    if ping_timeout > 0 && last_inbound.elapsed() > Duration::from_secs(ping_timeout) {
                        tracing::warn!(session = %session_id, "no inbound frames within keepalive timeout, dropping connection");
                        break;
                    }
                }
            }
        }

        self.cleanup_session(&session_id).await;
        conn.shutdown().await;
    }

    /// Parse and route one inbound frame.
    async fn handle_frame(
        &self,
        session_id: &str,
        frame: &str,
        outbound: &mpsc::Sender<Value>,
    ) {
        let request: Request = match serde_json::from_str(frame) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(session = session_id, error = %e, "invalid JSON frame");
                let _ = outbound.send(protocol::error_response(
                    ERROR_PARSE_ERROR,
                    "Parse error",
                    None,
                )).await;
                return;
            }
        };

        self.sessions.touch(session_id).await;
        tracing::debug!(session = session_id, method = %request.method, "dispatching request");

        match request.method.as_str() {
            "execute" => {
                self.handle_execute(session_id, request.params, request.id, outbound)
                    .await;
            }
            "control" => {
                self.handle_control(session_id, request.params, request.id, outbound)
                    .await;
            }
            "hook_status" => {
                let _ = outbound.send(protocol::response(self.hooks.status(), request.id)).await;
            }
            // Keepalive echoes need no reply.
            "ping" | "pong" => {}
            other => {
                let _ = outbound.send(protocol::error_response(
                    ERROR_METHOD_NOT_FOUND,
                    &format!("Unknown method: {other}"),
                    request.id,
                )).await;
            }
        }
    }

    /// Handle an `execute` request: validate, estimate, run pre-hooks,
    /// spawn, and start the streaming task.
    async fn handle_execute(
        &self,
        session_id: &str,
        params: Value,
        msg_id: Option<Value>,
        outbound: &mpsc::Sender<Value>,
    ) {
        let params: ExecuteParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => {
                let _ = outbound.send(protocol::error_response(
                    ERROR_INVALID_PARAMS,
                    &format!("Invalid params: {e}"),
                    msg_id,
                )).await;
                return;
            }
        };

        if let Err(message) = self.config.validate_command(&params.command) {
            let code = if params.command.trim().is_empty() {
                ERROR_INVALID_PARAMS
            } else {
                config::ERROR_COMMAND_NOT_ALLOWED
            };
            let _ = outbound.send(protocol::error_response(code, &message, msg_id)).await;
            return;
        }

        match self.sessions.state(session_id).await {
            Some(SessionState::Idle) => {}
            Some(_) => {
                let _ = outbound.send(protocol::error_response(
                    ERROR_INVALID_PARAMS,
                    "A process is already running",
                    msg_id,
                )).await;
                return;
            }
            None => return,
        }

        // Planned timeout: the request's value wins; otherwise the estimator
        // supplies one, optionally capped by the configured stream timeout.
        let timeout_secs = match params.timeout {
            Some(timeout) => timeout,
            None => {
                let estimate = self.estimator.estimate(&params.command).await;
                if self.config.enable_stream_timeout {
                    estimate.max_secs.min(self.config.stream_timeout_secs)
                } else {
                    estimate.max_secs
                }
            }
        };

        // Pre-execution hooks are advisory and never block execution.
        let mut command = params.command.clone();
        if self.hooks.enabled() {
            self.sessions
                .set_state(session_id, SessionState::PreHook)
                .await;
            command = self
                .run_pre_hooks(session_id, &command, outbound)
                .await;
        }

        let mut child = match self.processes.spawn(&command, None) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(session = session_id, error = %e, "failed to spawn process");
                let _ = outbound.send(protocol::error_response(
                    e.code(),
                    &e.to_string(),
                    msg_id,
                )).await;
                let _ = outbound.send(protocol::notification(
                    "process.failed",
                    serde_json::json!({
                        "status": "failed",
                        "error": e.to_string(),
                    }),
                )).await;
                self.sessions
                    .set_state(session_id, SessionState::Idle)
                    .await;
                return;
            }
        };

        let pid = child.id().unwrap_or_default();
        let pgid = self.processes.process_group_id(&child);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.sessions
            .bind_process(session_id, pid, pgid, cancel_tx)
            .await;
        self.sessions
            .set_state(session_id, SessionState::Running)
            .await;

        let _ = outbound.send(protocol::response(
            serde_json::json!({ "status": "started", "pid": pid, "pgid": pgid }),
            msg_id,
        )).await;
        let _ = outbound.send(protocol::notification(
            "process.started",
            StatusUpdate {
                status: "started",
                pid: Some(pid),
                pgid,
            },
        )).await;

        // Stdio handles move into the streaming task before the child does.
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let engine = self.clone();
        let session = session_id.to_string();
        let task = tokio::spawn(async move {
            engine
                .run_streaming(
                    &session,
                    child,
                    stdout,
                    stderr,
                    pid,
                    pgid,
                    command,
                    timeout_secs,
                    cancel_rx,
                )
                .await;
        });
        self.sessions.set_stream_task(session_id, task).await;
    }

    /// Run pre-execute hooks, surface failures as warnings, and apply any
    /// advisory command rewrite when configured to do so.
    async fn run_pre_hooks(
        &self,
        session_id: &str,
        command: &str,
        outbound: &mpsc::Sender<Value>,
    ) -> String {
        let advisory_path = std::env::temp_dir().join(format!(
            "execd-advisory-{}-{}.json",
            session_id,
            uuid::Uuid::new_v4()
        ));

        let mut context = HashMap::new();
        context.insert("command".to_string(), Value::String(command.to_string()));
        context.insert(
            "session_id".to_string(),
            Value::String(session_id.to_string()),
        );
        context.insert(
            "advisory_file".to_string(),
            Value::String(advisory_path.to_string_lossy().into_owned()),
        );

        let results = self.hooks.run("pre-execute", &context).await;
        for result in &results {
            if !result.success {
                self.send_hook_warning(outbound, result).await;
            }
        }

        let advisory = hooks::read_advisory(&advisory_path);
        let _ = std::fs::remove_file(&advisory_path);

        match advisory.wrapped_command {
            Some(wrapped) if self.config.allow_command_rewrite => {
                tracing::info!(session = session_id, "applying advisory command rewrite from pre-execute hook");
                wrapped
            }
            Some(_) => {
                tracing::info!(
                    session = session_id,
                    "pre-execute hook suggested a command rewrite; ignored (rewrite disabled)"
                );
                command.to_string()
            }
            None => command.to_string(),
        }
    }

    async fn send_hook_warning(
        &self,
        outbound: &mpsc::Sender<Value>,
        result: &crate::hooks::HookResult,
    ) {
        let stderr = if result.stderr.is_empty() {
            None
        } else {
            Some(result.stderr.chars().take(500).collect::<String>())
        };
        let error = result
            .error
            .clone()
            .unwrap_or_else(|| "Unknown error".to_string());
        let _ = outbound.send(protocol::notification(
            "hook.warning",
            serde_json::json!({
                "hook_type": result.hook_type,
                "error": error,
                "stderr": stderr,
                "message": format!("Hook '{}' failed but execution will continue", result.hook_type),
                "severity": "warning",
            }),
        )).await;
    }

    /// Handle a `control` request: signal the bound process group.
    async fn handle_control(
        &self,
        session_id: &str,
        params: Value,
        msg_id: Option<Value>,
        outbound: &mpsc::Sender<Value>,
    ) {
        let params: ControlParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => {
                let _ = outbound.send(protocol::error_response(
                    ERROR_INVALID_PARAMS,
                    &format!("Invalid params: {e}"),
                    msg_id,
                )).await;
                return;
            }
        };

        let Some((pid, pgid)) = self.sessions.process_ids(session_id).await else {
            let _ = outbound.send(protocol::error_response(
                config::ERROR_PROCESS_NOT_FOUND,
                "No process is running",
                msg_id,
            )).await;
            return;
        };

        if let Err(e) = self.processes.signal(pgid, params.kind) {
            let _ = outbound
                .send(protocol::error_response(e.code(), &e.to_string(), msg_id))
                .await;
            return;
        }

        let status = params.kind.status();
        // Acknowledge before the resulting status notification.
        let _ = outbound.send(protocol::response(
            serde_json::json!({ "status": status }),
            msg_id,
        )).await;
        let _ = outbound.send(protocol::notification(
            &format!("process.{status}"),
            StatusUpdate {
                status,
                pid: Some(pid),
                pgid: Some(pgid),
            },
        )).await;

        match params.kind {
            ControlKind::Pause => {
                self.sessions
                    .set_state(session_id, SessionState::Paused)
                    .await;
            }
            ControlKind::Resume => {
                self.sessions
                    .set_state(session_id, SessionState::Running)
                    .await;
            }
            ControlKind::Cancel => {
                self.sessions
                    .set_state(session_id, SessionState::Terminating)
                    .await;
                if let Some(cancel) = self.sessions.cancel_handle(session_id).await {
                    let _ = cancel.send(true);
                }
            }
        }
    }

    /// The streaming task: pump multiplexer events to the client, wait for
    /// exit/timeout/cancel, then run the common teardown path.
    #[allow(clippy::too_many_arguments)]
    async fn run_streaming(
        &self,
        session_id: &str,
        mut child: Child,
        stdout: tokio::process::ChildStdout,
        stderr: tokio::process::ChildStderr,
        pid: u32,
        pgid: Option<i32>,
        command: String,
        timeout_secs: u64,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        let Some(outbound) = self.sessions.outbound(session_id).await else {
            return;
        };
        let started = Instant::now();
        tracing::info!(
            session = session_id,
            pid,
            timeout_secs,
            "streaming process output"
        );

        let mux = StreamMultiplexer::new(
            self.config.max_buffer_size,
            self.config.max_line_ceiling,
            self.config.chunk_size,
        );
        let (tx, mut rx) = stream::channel();
        let stdout_task = mux.spawn_reader(stdout, StreamKind::Stdout, tx.clone(), started);
        let stderr_task = mux.spawn_reader(stderr, StreamKind::Stderr, tx, started);

        let mut collected: Vec<String> = Vec::new();
        let mut early = EarlyCompletion::default();

        let outcome = {
            let pump = async {
                while let Some(event) = rx.recv().await {
                    Self::forward_event(&outbound, event, &mut collected, &mut early).await;
                }
                // Streams hit EOF; reap the child with a bounded wait.
                match tokio::time::timeout(EXIT_WAIT_AFTER_EOF, child.wait()).await {
                    Ok(Ok(status)) => Some(process::exit_code(status)),
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "error waiting for process");
                        None
                    }
                    Err(_) => {
                        tracing::warn!("process wait timed out after streams closed");
                        child.try_wait().ok().flatten().map(process::exit_code)
                    }
                }
            };
            tokio::pin!(pump);
            tokio::select! {
                code = &mut pump => RunOutcome::Exited(code),
                _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => RunOutcome::TimedOut,
                _ = cancel_rx.changed() => RunOutcome::Canceled,
            }
        };

        self.sessions
            .set_state(session_id, SessionState::Terminating)
            .await;

        let mut timed_out = false;
        let mut canceled = false;
        let exit_code = match outcome {
            RunOutcome::Exited(code) => code,
            RunOutcome::TimedOut => {
                tracing::warn!(session = session_id, timeout_secs, "execution timed out");
                timed_out = true;
                self.drain_and_terminate(
                    &mut rx,
                    &outbound,
                    &mut collected,
                    &mut early,
                    [stdout_task, stderr_task],
                    &mut child,
                    pgid,
                )
                .await
            }
            RunOutcome::Canceled => {
                tracing::info!(session = session_id, "execution canceled");
                canceled = true;
                self.drain_and_terminate(
                    &mut rx,
                    &outbound,
                    &mut collected,
                    &mut early,
                    [stdout_task, stderr_task],
                    &mut child,
                    pgid,
                )
                .await
            }
        };

        let execution_time = started.elapsed().as_secs_f64();
        let success = exit_code == Some(0) && !timed_out && !canceled;
        let status = if success { "completed" } else { "failed" };
        tracing::info!(
            session = session_id,
            pid,
            ?exit_code,
            status,
            execution_time,
            "process finished"
        );

        // Only successful runs feed the timing history; failures and
        // cancellations would poison the estimates.
        if success {
            self.estimator.record(&command, execution_time, true);
        }

        if self.hooks.enabled() {
            self.sessions
                .set_state(session_id, SessionState::PostHook)
                .await;
            self.run_post_hooks(&command, exit_code, execution_time, &collected, &outbound)
                .await;
        }

        let time_saved = early
            .elapsed_secs
            .map(|elapsed| (execution_time - elapsed).max(0.0))
            .unwrap_or(0.0);
        if time_saved > 0.0 {
            tracing::info!(
                session = session_id,
                time_saved,
                "task completed earlier than process termination"
            );
        }

        let _ = outbound.send(protocol::notification(
            &format!("process.{status}"),
            CompletionUpdate {
                status,
                pid: Some(pid),
                pgid,
                exit_code,
                execution_time,
                timed_out,
                code: timed_out.then_some(config::ERROR_STREAM_TIMEOUT),
                early_completion_detected: early.elapsed_secs.is_some(),
                early_completion_time: early.elapsed_secs,
                time_saved,
                completion_marker: early.marker.clone(),
            },
        )).await;

        self.sessions.clear_process(session_id).await;
    }

    /// Grant the readers a brief window to drain bytes already in the pipes,
    /// then abort them and terminate the process group.
    #[allow(clippy::too_many_arguments)]
    async fn drain_and_terminate(
        &self,
        rx: &mut mpsc::Receiver<MuxEvent>,
        outbound: &mpsc::Sender<Value>,
        collected: &mut Vec<String>,
        early: &mut EarlyCompletion,
        reader_tasks: [tokio::task::JoinHandle<()>; 2],
        child: &mut Child,
        pgid: Option<i32>,
    ) -> Option<i32> {
        let _ = tokio::time::timeout(READER_DRAIN_GRACE, async {
            while let Some(event) = rx.recv().await {
                Self::forward_event(outbound, event, collected, early).await;
            }
        })
        .await;
        for task in reader_tasks {
            task.abort();
        }
        self.processes.terminate(child, pgid).await
    }

    /// Forward one multiplexer event to the client, maintaining the output
    /// sample and early-completion bookkeeping.
    async fn forward_event(
        outbound: &mpsc::Sender<Value>,
        event: MuxEvent,
        collected: &mut Vec<String>,
        early: &mut EarlyCompletion,
    ) {
        match event {
            MuxEvent::Output(output) => {
                if output.kind == StreamKind::Stdout && collected.len() < SAMPLE_MAX_LINES {
                    let sample: String =
                        output.data.chars().take(SAMPLE_MAX_LINE_BYTES).collect();
                    collected.push(sample);
                }
                let _ = outbound.send(protocol::notification("process.output", output)).await;
            }
            MuxEvent::EarlyCompletion {
                marker,
                file_path,
                elapsed_secs,
                output_line,
            } => {
                early.elapsed_secs = Some(elapsed_secs);
                early.marker = marker.clone().or_else(|| file_path.clone());
                let _ = outbound.send(protocol::notification(
                    "task.early_completion",
                    serde_json::json!({
                        "marker": marker,
                        "file_path": file_path,
                        "elapsed_time": elapsed_secs,
                        "output_line": output_line,
                    }),
                )).await;
            }
            MuxEvent::TokenLimit { limit, error_text } => {
                let _ = outbound.send(protocol::notification(
                    "error.token_limit_exceeded",
                    serde_json::json!({
                        "code": config::ERROR_TOKEN_LIMIT,
                        "error_type": "token_limit",
                        "limit": limit,
                        "message": format!("Output exceeded {limit} token limit"),
                        "suggestion": "Retry with a more concise prompt or specify word/token limits",
                        "error_text": error_text,
                        "recoverable": true,
                    }),
                )).await;
            }
            MuxEvent::RateLimit {
                error_type,
                message,
                reset_timestamp,
                retry_after,
                recoverable,
                error_text,
            } => {
                let _ = outbound.send(protocol::notification(
                    "error.rate_limit_exceeded",
                    serde_json::json!({
                        "error_type": error_type,
                        "message": message,
                        "reset_timestamp": reset_timestamp,
                        "retry_after": retry_after,
                        "recoverable": recoverable,
                        "error_text": error_text,
                    }),
                )).await;
            }
            MuxEvent::ReadError { kind, error } => {
                let _ = outbound.send(protocol::notification(
                    "process.error",
                    serde_json::json!({
                        "stream": kind,
                        "error": error,
                    }),
                )).await;
            }
        }
    }

    /// Run post-execute hooks; failures surface as warnings.
    async fn run_post_hooks(
        &self,
        command: &str,
        exit_code: Option<i32>,
        duration: f64,
        collected: &[String],
        outbound: &mpsc::Sender<Value>,
    ) {
        let mut context = HashMap::new();
        context.insert("command".to_string(), Value::String(command.to_string()));
        context.insert(
            "exit_code".to_string(),
            Value::from(exit_code.unwrap_or(-1)),
        );
        context.insert("duration".to_string(), Value::from(duration));
        context.insert(
            "output".to_string(),
            Value::String(collected.join("\n")),
        );

        let results = self.hooks.run("post-execute", &context).await;
        for result in &results {
            if !result.success {
                self.send_hook_warning(outbound, result).await;
            }
        }
    }

    /// Tear down a session after disconnect or idle expiry. Idempotent.
    async fn cleanup_session(&self, session_id: &str) {
        let Some(session) = self.sessions.remove(session_id).await else {
            return;
        };
        tracing::info!(session = session_id, "cleaning up session");

        // Disconnect is equivalent to cancel: the streaming task terminates
        // the process group and finishes its teardown.
        if let Some(cancel) = &session.cancel {
            let _ = cancel.send(true);
        }
        if let Some(task) = session.stream_task {
            let bound = config::TERMINATE_GRACE + config::TERMINATE_KILL_WAIT + Duration::from_secs(2);
            if tokio::time::timeout(bound, task).await.is_err() {
                tracing::warn!(session = session_id, "streaming task did not stop in time");
            }
        }
    }

    /// Remove sessions idle past the configured timeout.
    pub async fn cleanup_idle_sessions(&self) -> usize {
        self.sessions
            .cleanup_idle(Duration::from_secs(self.config.session_timeout_secs))
            .await
    }
}
