//! Duocast Server - headless session coordinator.
//!
//! Groups devices into sessions, assigns each one a channel of the
//! stereo field, ingests remote sources into per-channel artifacts, and
//! broadcasts scheduled playback events so every device starts at the
//! same wall-clock instant.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use duocast_core::{start_server, AppState, LocalIpDetector, NetworkContext};
use tokio::signal;

use crate::config::ServerConfig;

/// Duocast Server - synchronized multi-device stereo playback.
#[derive(Parser, Debug)]
#[command(name = "duocast-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "DUOCAST_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "DUOCAST_BIND_PORT")]
    port: Option<u16>,

    /// Advertise IP address (overrides config file).
    #[arg(short = 'a', long, env = "DUOCAST_ADVERTISE_IP")]
    advertise_ip: Option<std::net::IpAddr>,

    /// Data directory for persistent state (session bindings).
    #[arg(short = 'd', long, env = "DUOCAST_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Audio library directory (one subdirectory per track).
    #[arg(long, env = "DUOCAST_AUDIO_ROOT")]
    audio_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Duocast Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.bind_port = port;
    }
    if let Some(ip) = args.advertise_ip {
        config.advertise_ip = Some(ip);
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(audio_root) = args.audio_root {
        config.audio_root = audio_root;
    }

    // Resolve advertise IP: use explicit config, or fall back to auto-detection
    let network = if let Some(ip) = config.advertise_ip {
        log::info!(
            "Configuration: bind_port={}, advertise_ip={}",
            config.bind_port,
            ip
        );
        NetworkContext::explicit(config.bind_port, ip)
    } else {
        log::info!(
            "Configuration: bind_port={}, advertise_ip=auto",
            config.bind_port
        );
        NetworkContext::auto_detect(config.bind_port, LocalIpDetector::arc()).context(
            "Failed to auto-detect local IP address. \
             Please specify --advertise-ip or set DUOCAST_ADVERTISE_IP to the IP \
             address that other devices can reach.",
        )?
    };

    let core_config = config.to_core_config();
    core_config
        .validate()
        .map_err(|e| anyhow::anyhow!(e))
        .context("Invalid configuration")?;

    std::fs::create_dir_all(&core_config.audio_root).with_context(|| {
        format!(
            "Failed to create audio root {}",
            core_config.audio_root.display()
        )
    })?;

    log::info!(
        "Audio root: {}, data dir: {}",
        core_config.audio_root.display(),
        core_config.data_dir.display()
    );

    // Rehydrates persisted session bindings as part of construction
    let app_state = AppState::from_config(core_config, network);
    let bind_port = config.bind_port;

    let server_state = app_state.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_state, bind_port).await {
            log::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    // Close client connections; in-flight transcoders die with the
    // process via kill-on-drop.
    app_state.registry.close_all();
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
