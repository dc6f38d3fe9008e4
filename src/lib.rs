//! execd: a JSON-RPC command-execution service.
//!
//! Clients connect over a bidirectional text-frame channel, submit shell
//! commands, receive streamed stdout/stderr plus side-channel events (early
//! completion, token/rate-limit errors), and can pause, resume, or cancel
//! the running process group.

pub mod config;
pub mod engine;
pub mod error;
pub mod estimator;
pub mod hooks;
pub mod monitor;
pub mod process;
pub mod protocol;
pub mod session;
pub mod store;
pub mod stream;
pub mod transport;
