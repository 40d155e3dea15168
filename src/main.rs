//! bloomkv - A Network Counting Service
//!
//! This is the main entry point for the bloomkv server.
//! It loads the configuration, opens the store, binds the listener and
//! serves connections until Ctrl+C.

use anyhow::Context;
use bloomkv::commands::CommandHandler;
use bloomkv::config::{ServerConfig, DEFAULT_CONFIG_FILE};
use bloomkv::connection::ConnectionStats;
use bloomkv::server::{self, Server};
use bloomkv::storage::ScalingBloom;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Counting service over a scaling counting bloom filter
#[derive(Parser, Debug)]
#[command(name = "bloomkv", version)]
struct Args {
    /// INI configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Listen address, overrides `service_port` from the config file
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Set up logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let mut config = ServerConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(listen) = args.listen {
        config.service_port = listen;
    }
    info!(
        filename = %config.filename.display(),
        capacity = config.capacity,
        error_rate = config.error_rate,
        listen = %config.listen_addr(),
        idle_timeout = ?config.idle_timeout,
        "Configuration loaded"
    );

    // Open the store (shared across all connections)
    let store = ScalingBloom::open(config.capacity, config.error_rate, &config.filename)
        .with_context(|| format!("failed to open store {}", config.filename.display()))?;
    let command_handler = CommandHandler::new(Arc::new(store));

    // Bind the TCP listener
    let listen_addr = config.listen_addr();
    let listener = server::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to listen on {}", listen_addr))?;

    info!("bloomkv v{} ready to accept connections", bloomkv::VERSION);

    let server = Server::new(
        listener,
        command_handler.clone(),
        Arc::new(ConnectionStats::new()),
        config.idle_timeout,
    );

    // Serve until Ctrl+C
    tokio::select! {
        _ = server.run() => {}
        result = signal::ctrl_c() => {
            result.context("failed to install Ctrl+C handler")?;
            info!("Shutdown signal received, stopping server...");
        }
    }

    match command_handler.save_async().await {
        Ok(()) => info!(path = %config.filename.display(), "Store flushed"),
        Err(e) => error!(error = %e, "Failed to flush store on shutdown"),
    }

    info!("Server shutdown complete");
    Ok(())
}
