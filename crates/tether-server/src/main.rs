//! Tether demo server: handshake, identification and lobby chat on a fixed
//! tick.
//!
//! Run with: `cargo run -p tether-server -- --port 7777`

mod lobby;
mod messages;

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tether_config::{CliArgs, Config, NetworkConfig, default_config_dir};
use tether_net::{ConnectionManager, ManagerConfig, SocketConfig};
use tracing::info;

use crate::lobby::Lobby;

/// Reason sent to every client when the server shuts down.
const SHUTDOWN_REASON: &str = "server shutting down";

fn manager_config(network: &NetworkConfig) -> ManagerConfig {
    ManagerConfig {
        max_connections: network.max_connections,
        pulse_budget: network.pulse_budget(),
        shutdown_timeout: network.shutdown_timeout(),
        socket: SocketConfig::default(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let config_dir = match args.config.clone() {
        Some(dir) => dir,
        None => default_config_dir().context("no config directory on this platform, pass --config")?,
    };

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    tether_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    let network = &config.network;
    let address: IpAddr = network
        .bind_address
        .parse()
        .with_context(|| format!("invalid bind address {:?}", network.bind_address))?;

    let lobby = Arc::new(Lobby::new());
    let protocol = lobby::build_protocol(Arc::clone(&lobby), network.opcode_capacity)
        .context("failed to build protocol")?;
    protocol.log_summary();

    let manager = Arc::new(ConnectionManager::new(
        Arc::new(protocol),
        manager_config(network),
    ));
    lobby.attach(&manager);

    if !manager.bind(address, network.port) {
        bail!("failed to bind {address}:{}", network.port);
    }
    info!(
        "Tether server listening on {:?} at {} Hz (max {} connections)",
        manager.local_addrs(),
        network.tick_rate_hz,
        network.max_connections
    );

    tokio::select! {
        () = manager.run(network.tick_interval()) => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("Shutdown requested");
        }
    }

    manager.stop(SHUTDOWN_REASON).await;
    info!("Tether server stopped");
    Ok(())
}
