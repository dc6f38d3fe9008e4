//! Typed errors for process control and hook execution.
//!
//! Internal APIs return these instead of stringly-typed errors; the engine
//! translates them to JSON-RPC error codes at the transport boundary.

use crate::config;
use thiserror::Error;

/// Errors from process spawning and control.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The target process group no longer exists.
    #[error("process group {0} not found")]
    NotFound(i32),
    /// The child could not be spawned.
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    /// A signal could not be delivered.
    #[error("failed to signal process group {pgid}: {source}")]
    Signal {
        pgid: i32,
        #[source]
        source: nix::Error,
    },
}

impl ProcessError {
    /// JSON-RPC error code for this error.
    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            Self::NotFound(_) => config::ERROR_PROCESS_NOT_FOUND,
            Self::Spawn(_) | Self::Signal { .. } => config::ERROR_INTERNAL_ERROR,
        }
    }
}

/// Errors from hook command resolution and launch.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("invalid hook command: {0}")]
    InvalidCommand(String),
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("hook timed out after {0}s")]
    Timeout(u64),
    #[error("hook I/O error: {0}")]
    Io(#[from] std::io::Error),
}
