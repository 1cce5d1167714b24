//! Screenreel Server – stores uploaded screen recordings under a quota.
//!
//! This binary:
//! 1. Reads configuration from `screenreel.conf`
//! 2. Opens the recordings directory and the rate-limit state
//! 3. Runs an axum HTTP server exposing the action endpoint and the
//!    stored files to recorder clients.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use screenreel_common::config::{self, Config};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| Config::default_path().to_string());
    let config = config::load(&PathBuf::from(&config_path)).context("Config load failed")?;

    info!(
        "Screenreel Server starting (listen={}, recordings={})",
        config.listen_addr,
        config.recordings_dir.display()
    );

    std::fs::create_dir_all(&config.state_dir).context("Cannot create state directory")?;

    // ── ctrl-c ───────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_flag.store(true, Ordering::Relaxed);
        info!("Shutdown signal received");
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── HTTP server ──────────────────────────────────────────────────
    screenreel_server::server::run(config, shutdown).await?;

    info!("Screenreel Server stopped");
    Ok(())
}
