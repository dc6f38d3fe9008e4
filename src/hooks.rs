//! Out-of-process hook execution with strict isolation.
//!
//! Hooks are external commands configured declaratively and run before/after
//! executions. They are never on the critical path: resolution failures,
//! non-zero exits, and timeouts all degrade to warnings. Context reaches the
//! hook through `EXECD_*` environment variables; structured values are
//! JSON-encoded. A pre-execution hook may write advisory JSON to the file
//! named by `EXECD_ADVISORY_FILE`, which the session engine reads back.

use crate::error::HookError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Global fallback timeout for a single hook invocation.
const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 60;

/// Grace between SIGTERM and SIGKILL when a hook times out.
const HOOK_KILL_GRACE: Duration = Duration::from_millis(500);

/// Captured output beyond this is truncated in log lines (never in results).
const LOG_MAX_LENGTH: usize = 10_000;

/// How many recent hook executions are retained for `hook_status`.
const RECENT_EXECUTIONS: usize = 10;

/// One configured hook: a bare command string or an object with its own timeout.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HookSpec {
    Command(String),
    Detailed {
        command: String,
        #[serde(default)]
        timeout: Option<u64>,
    },
}

impl HookSpec {
    fn command(&self) -> &str {
        match self {
            Self::Command(c) => c,
            Self::Detailed { command, .. } => command,
        }
    }

    fn timeout(&self) -> Option<u64> {
        match self {
            Self::Command(_) => None,
            Self::Detailed { timeout, .. } => *timeout,
        }
    }
}

/// One hook kind may map to a single spec or an ordered list of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HookEntry {
    One(HookSpec),
    Many(Vec<HookSpec>),
}

impl HookEntry {
    fn specs(&self) -> Vec<&HookSpec> {
        match self {
            Self::One(spec) => vec![spec],
            Self::Many(specs) => specs.iter().collect(),
        }
    }
}

/// The hook configuration file format.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookConfig {
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub hooks: HashMap<String, HookEntry>,
}

/// Result of a single hook invocation.
#[derive(Debug, Clone, Serialize)]
pub struct HookResult {
    pub hook_type: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A bounded record of one execution, kept for `hook_status`.
#[derive(Debug, Clone, Serialize)]
pub struct HookExecutionRecord {
    pub hook_type: String,
    pub success: bool,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct HookMetrics {
    recent: VecDeque<HookExecutionRecord>,
    total: u64,
    succeeded: u64,
    failed: u64,
}

/// Advisory data a pre-execution hook may hand back through the advisory file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Advisory {
    #[serde(default)]
    pub wrapped_command: Option<String>,
}

/// Executes configured hooks and tracks their outcomes.
#[derive(Debug, Clone)]
pub struct HookRunner {
    config: Option<HookConfig>,
    metrics: Arc<Mutex<HookMetrics>>,
}

impl HookRunner {
    /// Load hook configuration from a JSON file. A missing or unreadable file
    /// leaves the runner disabled; hooks are optional.
    #[must_use]
    pub fn load(path: &str) -> Self {
        let config = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<HookConfig>(&raw) {
                Ok(config) => {
                    tracing::info!(path, hooks = config.hooks.len(), "loaded hook configuration");
                    Some(config)
                }
                Err(e) => {
                    tracing::error!(path, error = %e, "invalid hook configuration, hooks disabled");
                    None
                }
            },
            Err(_) => {
                tracing::debug!(path, "no hook configuration found");
                None
            }
        };
        Self {
            config,
            metrics: Arc::new(Mutex::new(HookMetrics::default())),
        }
    }

    /// Build a runner directly from a parsed configuration (used by tests).
    #[must_use]
    pub fn from_config(config: HookConfig) -> Self {
        Self {
            config: Some(config),
            metrics: Arc::new(Mutex::new(HookMetrics::default())),
        }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config
            .as_ref()
            .is_some_and(|c| !c.hooks.is_empty())
    }

    /// Execute all hooks configured for `hook_type`, in order.
    ///
    /// Each hook gets the context as `EXECD_*` env vars. Failures are
    /// captured in the returned results, never propagated.
    pub async fn run(&self, hook_type: &str, context: &HashMap<String, Value>) -> Vec<HookResult> {
        let Some(config) = &self.config else {
            return Vec::new();
        };
        let Some(entry) = config.hooks.get(hook_type) else {
            return Vec::new();
        };

        let mut results = Vec::new();
        for spec in entry.specs() {
            let started = Instant::now();
            let timeout = spec
                .timeout()
                .or(config.timeout)
                .unwrap_or(DEFAULT_HOOK_TIMEOUT_SECS);
            let result = match self.invoke(spec.command(), timeout, &config.env, context).await {
                Ok((exit_code, stdout, stderr)) => HookResult {
                    hook_type: hook_type.to_string(),
                    exit_code,
                    success: exit_code == Some(0),
                    error: match exit_code {
                        Some(0) => None,
                        Some(code) => Some(format!("exit code {code}")),
                        None => Some("killed by signal".to_string()),
                    },
                    stdout,
                    stderr,
                },
                Err(e) => HookResult {
                    hook_type: hook_type.to_string(),
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    success: false,
                    error: Some(e.to_string()),
                },
            };

            if !result.success {
                tracing::warn!(
                    hook_type,
                    error = ?result.error,
                    exit_code = ?result.exit_code,
                    "hook failed"
                );
            }
            self.record(&result, started.elapsed().as_secs_f64());
            results.push(result);
        }
        results
    }

    /// Launch one hook command and capture its output.
    async fn invoke(
        &self,
        command: &str,
        timeout_secs: u64,
        extra_env: &HashMap<String, String>,
        context: &HashMap<String, Value>,
    ) -> Result<(Option<i32>, String, String), HookError> {
        let mut args = shell_words::split(command)
            .map_err(|e| HookError::InvalidCommand(e.to_string()))?;
        if args.is_empty() {
            return Err(HookError::InvalidCommand("empty command".to_string()));
        }

        // Resolve the executable up front so a missing binary is a structured
        // error, not a confusing spawn failure.
        let executable = &args[0];
        if Path::new(executable).is_absolute() {
            if !Path::new(executable).exists() {
                return Err(HookError::ExecutableNotFound(executable.clone()));
            }
        } else {
            let resolved = which::which(executable)
                .map_err(|_| HookError::ExecutableNotFound(executable.clone()))?;
            args[0] = resolved.to_string_lossy().into_owned();
        }

        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..]);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd.envs(extra_env);
        for (key, value) in context {
            let env_key = format!("EXECD_{}", key.to_uppercase());
            let env_value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            cmd.env(env_key, env_value);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();

        let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        let status = tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait()).await;

        match status {
            Ok(Ok(status)) => {
                let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default())
                    .into_owned();
                let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default())
                    .into_owned();
                if !stdout.is_empty() {
                    tracing::debug!(
                        bytes = stdout.len(),
                        "hook stdout: {}",
                        truncate_for_log(&stdout)
                    );
                }
                Ok((status.code(), stdout, stderr))
            }
            Ok(Err(e)) => Err(HookError::Io(e)),
            Err(_) => {
                // Graceful termination first, then force-kill after a short grace.
                if let Some(pid) = pid {
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(pid as i32),
                        nix::sys::signal::Signal::SIGTERM,
                    );
                }
                tokio::time::sleep(HOOK_KILL_GRACE).await;
                let _ = child.start_kill();
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                Err(HookError::Timeout(timeout_secs))
            }
        }
    }

    fn record(&self, result: &HookResult, duration_seconds: f64) {
        let Ok(mut metrics) = self.metrics.lock() else {
            return;
        };
        metrics.total += 1;
        if result.success {
            metrics.succeeded += 1;
        } else {
            metrics.failed += 1;
        }
        metrics.recent.push_front(HookExecutionRecord {
            hook_type: result.hook_type.clone(),
            success: result.success,
            duration_seconds,
            error: result.error.clone(),
        });
        metrics.recent.truncate(RECENT_EXECUTIONS);
    }

    /// Current hook status for the `hook_status` RPC.
    #[must_use]
    pub fn status(&self) -> Value {
        let mut hooks_configured: Vec<String> = self
            .config
            .as_ref()
            .map(|c| c.hooks.keys().cloned().collect())
            .unwrap_or_default();
        hooks_configured.sort();

        let (recent, statistics) = match self.metrics.lock() {
            Ok(metrics) => (
                metrics.recent.iter().cloned().collect::<Vec<_>>(),
                serde_json::json!({
                    "total": metrics.total,
                    "succeeded": metrics.succeeded,
                    "failed": metrics.failed,
                }),
            ),
            Err(_) => (Vec::new(), serde_json::json!({})),
        };

        serde_json::json!({
            "enabled": self.enabled(),
            "hooks_configured": hooks_configured,
            "timeout": self.config.as_ref().and_then(|c| c.timeout),
            "recent_executions": recent,
            "statistics": statistics,
        })
    }
}

/// Read advisory data written by a pre-execution hook, if any.
#[must_use]
pub fn read_advisory(path: &Path) -> Advisory {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "unparseable hook advisory data, ignoring");
            Advisory::default()
        }),
        Err(_) => Advisory::default(),
    }
}

fn truncate_for_log(s: &str) -> &str {
    if s.len() <= LOG_MAX_LENGTH {
        return s;
    }
    let mut end = LOG_MAX_LENGTH;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
