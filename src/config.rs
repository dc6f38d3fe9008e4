//! Service configuration loaded from environment variables.
//!
//! All tunables live here so they are easy to find and to override in tests.
//! Values follow the `EXECD_` prefix convention; unset variables fall back to
//! the defaults documented on each field.

use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;

/// JSON-RPC 2.0 protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

// JSON-RPC 2.0 standard error codes.
pub const ERROR_PARSE_ERROR: i64 = -32700;
pub const ERROR_INVALID_REQUEST: i64 = -32600;
pub const ERROR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERROR_INVALID_PARAMS: i64 = -32602;
pub const ERROR_INTERNAL_ERROR: i64 = -32603;

// Service-specific error codes.
pub const ERROR_COMMAND_NOT_ALLOWED: i64 = -32001;
pub const ERROR_PROCESS_NOT_FOUND: i64 = -32002;
pub const ERROR_SESSION_LIMIT: i64 = -32003;
pub const ERROR_TOKEN_LIMIT: i64 = -32004;
// Stream timeouts report the same code as token limits on the wire.
pub const ERROR_STREAM_TIMEOUT: i64 = ERROR_TOKEN_LIMIT;

/// Fixed grace period between SIGTERM and SIGKILL during termination.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Final bound on waiting for a killed process to be reaped.
pub const TERMINATE_KILL_WAIT: Duration = Duration::from_secs(5);

/// Grace period granted to stream readers to drain buffered bytes after a
/// timeout or cancel, before their tasks are aborted.
pub const READER_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Runtime configuration for the service.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,
    /// Idle session timeout in seconds.
    pub session_timeout_secs: u64,
    /// Maximum size of a single logical output line before it is flushed.
    pub max_buffer_size: usize,
    /// Hard ceiling on one logical line; beyond this the remainder is dropped.
    pub max_line_ceiling: usize,
    /// Maximum size of a single `process.output` notification payload.
    pub chunk_size: usize,
    /// Allowed command prefixes. `None` means all commands are allowed.
    pub allowed_commands: Option<Vec<String>>,
    /// Base stream timeout in seconds, used when enforcement is enabled.
    pub stream_timeout_secs: u64,
    /// Whether to enforce the stream timeout for requests without an explicit timeout.
    pub enable_stream_timeout: bool,
    /// Default/hard-floor execution timeout in seconds.
    pub default_timeout_secs: u64,
    /// Keepalive ping notification interval in seconds.
    pub ping_interval_secs: u64,
    /// Inbound inactivity limit in seconds. 0 disables enforcement.
    pub ping_timeout_secs: u64,
    /// Path to the hook configuration file.
    pub hooks_path: String,
    /// Whether pre-hook advisory data may rewrite the command.
    pub allow_command_rewrite: bool,
    /// Timing store entry TTL in seconds.
    pub timing_ttl_secs: u64,
}

impl Config {
    /// Load configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            max_sessions: env_parse("EXECD_MAX_SESSIONS", 100),
            session_timeout_secs: env_parse("EXECD_SESSION_TIMEOUT", 3600),
            max_buffer_size: env_parse("EXECD_MAX_BUFFER_SIZE", 8 * 1024 * 1024),
            max_line_ceiling: 16 * 1024 * 1024,
            chunk_size: env_parse("EXECD_CHUNK_SIZE", 64 * 1024),
            allowed_commands: std::env::var("EXECD_ALLOWED_COMMANDS")
                .ok()
                .map(|raw| {
                    raw.split(',')
                        .map(|c| c.trim().to_string())
                        .filter(|c| !c.is_empty())
                        .collect::<Vec<_>>()
                })
                .filter(|v: &Vec<String>| !v.is_empty()),
            stream_timeout_secs: env_parse("EXECD_STREAM_TIMEOUT", 600),
            enable_stream_timeout: env_flag("EXECD_ENABLE_STREAM_TIMEOUT"),
            default_timeout_secs: env_parse("EXECD_DEFAULT_TIMEOUT", 300),
            ping_interval_secs: env_parse("EXECD_PING_INTERVAL", 30),
            ping_timeout_secs: env_parse("EXECD_PING_TIMEOUT", 0),
            hooks_path: std::env::var("EXECD_HOOKS")
                .unwrap_or_else(|_| ".execd-hooks.json".to_string()),
            allow_command_rewrite: env_flag("EXECD_ALLOW_COMMAND_REWRITE"),
            timing_ttl_secs: env_parse("EXECD_TIMING_TTL", 7 * 24 * 3600),
        }
    }

    /// Validate a command against the allow-list policy.
    ///
    /// An empty allow-list permits everything. Otherwise the first word of
    /// the command must equal one of the allowed prefixes.
    pub fn validate_command(&self, command: &str) -> Result<(), String> {
        if command.trim().is_empty() {
            return Err("Command cannot be empty".to_string());
        }

        if let Some(allowed) = &self.allowed_commands {
            let base = command
                .trim()
                .split_whitespace()
                .next()
                .unwrap_or_default();
            if !allowed.iter().any(|a| base == a) {
                return Err(format!("Command '{base}' is not allowed"));
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

/// Returns the set of env var names to strip from child processes.
///
/// `ANTHROPIC_API_KEY` is always removed so that a locally authenticated LLM
/// CLI keeps its own auth path instead of silently switching to API-key
/// billing. Additional names come from `EXECD_STRIP_ENV` as a comma-separated
/// list.
pub fn stripped_env_vars() -> &'static HashSet<String> {
    static STRIPPED: LazyLock<HashSet<String>> = LazyLock::new(|| {
        let mut set: HashSet<String> = std::env::var("EXECD_STRIP_ENV")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        set.insert("ANTHROPIC_API_KEY".to_string());
        set
    });
    &STRIPPED
}

/// Returns true if an environment variable must not reach child processes.
pub fn is_stripped_env(name: &str) -> bool {
    stripped_env_vars().contains(&name.to_uppercase())
}
