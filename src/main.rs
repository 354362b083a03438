//! Tunnel server CLI application.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tunneld::{
    watch_signals, ServerConfig, ShutdownSignal, TunManager, TunnelServer, DEFAULT_CONFIG_FILE,
};

#[derive(Parser)]
#[command(name = "tunneld")]
#[command(about = "TCP-to-TUN tunnel server")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with env overrides
    // Priority: RUST_LOG (standard), then RUST_LOG_LEVEL, then --verbose flag
    let fallback = if cli.verbose { "debug" } else { "info" };
    let default_level = std::env::var("RUST_LOG_LEVEL").unwrap_or_else(|_| fallback.to_string());
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level.clone()))
        .unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).without_time())
        .try_init()
        .ok();

    let config = load_config(&cli.config)?;

    let shutdown = ShutdownSignal::new();
    let signal_watch = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = watch_signals(signal_watch).await {
            error!("Signal handler failed: {}", e);
        }
    });

    let manager = Arc::new(TunManager::new(
        &config.tun_name_prefix,
        config.tunnel_addr,
        config.netmask,
        config.mtu,
    ));

    let server =
        TunnelServer::bind(&config, manager, shutdown).context("Failed to start tunnel server")?;
    server.run().await?;

    info!("Shutdown complete");
    Ok(())
}

/// Load the configuration, falling back to defaults when the file is absent.
fn load_config(path: &str) -> Result<ServerConfig> {
    if Path::new(path).exists() {
        info!("Loading configuration from: {}", path);
        ServerConfig::from_file(path)
    } else {
        info!("Config file {} not found, using defaults", path);
        let config = ServerConfig::default();
        config.validate()?;
        Ok(config)
    }
}
