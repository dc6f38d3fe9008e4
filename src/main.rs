//! Entry point for the execd service.
//!
//! Initializes tracing (to stderr, so it doesn't interfere with the JSON-RPC
//! stdio transport), wires the engine's dependencies together, and serves a
//! single connection on stdin/stdout. A background janitor expires idle
//! sessions.

use anyhow::Result;
use execd::config::Config;
use execd::engine::SessionEngine;
use execd::estimator::TimeoutEstimator;
use execd::hooks::HookRunner;
use execd::monitor::ResourceMonitor;
use execd::process::ProcessManager;
use execd::session::SessionManager;
use execd::store::TimingStore;
use std::time::Duration;
use tracing_subscriber::{self, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing to stderr (stdout carries JSON-RPC frames).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("starting execd v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env();
    let sessions = SessionManager::new(config.max_sessions);
    let store = TimingStore::new(Duration::from_secs(config.timing_ttl_secs));
    let monitor = ResourceMonitor::new();
    let estimator = TimeoutEstimator::new(store, monitor, config.default_timeout_secs);
    let hooks = HookRunner::load(&config.hooks_path);
    if hooks.enabled() {
        tracing::info!("hook integration enabled");
    }

    let engine = SessionEngine::new(
        config,
        sessions,
        ProcessManager::new(),
        hooks,
        estimator,
    );

    // Expire idle sessions in the background.
    let janitor = engine.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let removed = janitor.cleanup_idle_sessions().await;
            if removed > 0 {
                tracing::info!(removed, "expired idle sessions");
            }
        }
    });

    engine
        .handle_connection(tokio::io::stdin(), tokio::io::stdout())
        .await;

    tracing::info!("execd shut down");
    Ok(())
}
