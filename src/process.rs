//! Subprocess lifecycle: spawn in a new process group, signal, terminate.
//!
//! Every child runs in its own process group (via `setsid` before exec) so
//! the whole subtree can be paused, resumed, or killed atomically. Stdin is
//! closed, stdout/stderr are piped, and output buffering is defeated both by
//! environment (`PYTHONUNBUFFERED`, `NODE_NO_READLINE`) and, for known
//! line-buffering tools, an `stdbuf -o0 -e0` prefix. Without this, CLI output
//! arrives in bursts and streaming stalls.

use crate::config::{self, TERMINATE_GRACE, TERMINATE_KILL_WAIT};
use crate::error::ProcessError;
use crate::protocol::ControlKind;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::{Child, Command};

/// CLI tools that line-buffer when not attached to a terminal.
const BUFFERING_TOOLS: &[&str] = &["claude", "python", "node", "npm", "npx"];

/// Whether `stdbuf` is available on this host. Checked once.
static STDBUF_AVAILABLE: LazyLock<bool> =
    LazyLock::new(|| which::which("stdbuf").is_ok());

/// Owns subprocess creation and process-group control.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessManager;

impl ProcessManager {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Spawn a shell command in a new process group.
    pub fn spawn(&self, command: &str, cwd: Option<&Path>) -> Result<Child, ProcessError> {
        let command = wrap_unbuffered(command);
        tracing::info!(command = %truncated(&command), "executing command in new process group");

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(&command);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        // Scrub auth-changing variables so the child tool keeps its own auth
        // path, plus anything the operator listed in EXECD_STRIP_ENV.
        for (key, _) in std::env::vars() {
            if config::is_stripped_env(&key) {
                cmd.env_remove(&key);
            }
        }
        cmd.env("PYTHONUNBUFFERED", "1");
        cmd.env("NODE_NO_READLINE", "1");

        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        // SAFETY: pre_exec runs between fork and exec in the child.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::other)?;
                Ok(())
            });
        }

        Ok(cmd.spawn()?)
    }

    /// Process group id of a spawned child, or `None` if it already exited.
    #[must_use]
    pub fn process_group_id(&self, child: &Child) -> Option<i32> {
        let pid = child.id()?;
        nix::unistd::getpgid(Some(Pid::from_raw(pid as i32)))
            .ok()
            .map(Pid::as_raw)
    }

    /// Send a control signal to a process group.
    ///
    /// PAUSE/RESUME/CANCEL map to SIGSTOP/SIGCONT/SIGTERM at the group
    /// level. A vanished group yields [`ProcessError::NotFound`].
    pub fn signal(&self, pgid: i32, kind: ControlKind) -> Result<(), ProcessError> {
        let sig = match kind {
            ControlKind::Pause => Signal::SIGSTOP,
            ControlKind::Resume => Signal::SIGCONT,
            ControlKind::Cancel => Signal::SIGTERM,
        };

        match signal::killpg(Pid::from_raw(pgid), sig) {
            Ok(()) => {
                tracing::info!(pgid, signal = %sig, "sent signal to process group");
                Ok(())
            }
            Err(nix::errno::Errno::ESRCH) => Err(ProcessError::NotFound(pgid)),
            Err(source) => Err(ProcessError::Signal { pgid, source }),
        }
    }

    /// Check whether the child is still running.
    #[must_use]
    pub fn alive(&self, child: &mut Child) -> bool {
        matches!(child.try_wait(), Ok(None))
    }

    /// Terminate a child and its whole group: SIGTERM, a fixed 2 s grace,
    /// then SIGKILL with a final bounded wait.
    ///
    /// Idempotent: once the process is dead, repeated calls return the same
    /// exit code. Returns `None` only if the group could not be reaped.
    pub async fn terminate(&self, child: &mut Child, pgid: Option<i32>) -> Option<i32> {
        if let Ok(Some(status)) = child.try_wait() {
            return Some(exit_code(status));
        }

        if let Some(pgid) = pgid {
            match signal::killpg(Pid::from_raw(pgid), Signal::SIGTERM) {
                Ok(()) => tracing::info!(pgid, "sent SIGTERM to process group"),
                Err(nix::errno::Errno::ESRCH) => {
                    tracing::info!(pgid, "process group already gone")
                }
                Err(e) => tracing::error!(pgid, error = %e, "error sending SIGTERM"),
            }

            // Always allow the full grace period before escalating,
            // regardless of any caller-side timeout.
            if let Ok(Ok(status)) = tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                let code = exit_code(status);
                tracing::info!(code, "process terminated gracefully");
                return Some(code);
            }

            tracing::warn!(pgid, "grace period elapsed, sending SIGKILL to process group");
            tokio::time::sleep(Duration::from_millis(100)).await;
            match signal::killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => tracing::error!(pgid, error = %e, "error sending SIGKILL"),
            }
        }

        match tokio::time::timeout(TERMINATE_KILL_WAIT, child.wait()).await {
            Ok(Ok(status)) => Some(exit_code(status)),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "error waiting for terminated process");
                None
            }
            Err(_) => {
                tracing::error!("process could not be terminated even with SIGKILL");
                None
            }
        }
    }

    /// Clean up a (possibly still running) process during session teardown.
    pub async fn cleanup(&self, child: &mut Child, pgid: Option<i32>) {
        if self.alive(child) {
            tracing::info!("cleaning up process during session teardown");
            self.terminate(child, pgid).await;
        }
    }
}

/// Map an exit status to a numeric code, negating the signal number for
/// signal-terminated processes (so SIGTERM reads as -15).
#[must_use]
pub fn exit_code(status: std::process::ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| -s))
        .unwrap_or(-1)
}

/// Prefix known line-buffering tools with `stdbuf -o0 -e0` when available.
fn wrap_unbuffered(command: &str) -> String {
    if *STDBUF_AVAILABLE {
        let first = command.trim().split_whitespace().next().unwrap_or_default();
        if BUFFERING_TOOLS.contains(&first) {
            tracing::info!(tool = first, "wrapping command with stdbuf for unbuffered output");
            return format!("stdbuf -o0 -e0 {command}");
        }
    }
    command.to_string()
}

fn truncated(command: &str) -> &str {
    if command.len() <= 100 {
        return command;
    }
    let mut end = 100;
    while !command.is_char_boundary(end) {
        end -= 1;
    }
    &command[..end]
}
