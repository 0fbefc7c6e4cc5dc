//! apelios-core - Main entry point
//!
//! `relay`, `send` and `receive` share one configuration file and logging
//! setup.

mod args;

use apelios_core::config::Config;
use apelios_core::media::StopReason;
use apelios_core::receiver::run_receiver;
use apelios_core::sender::run_sender;
use apelios_core::signaling::{run_relay_server, Relay, RelayServerConfig};
use args::{Args, Command};
use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let config_result = args.load_config();
    let mut config = match &config_result {
        Ok(cfg) => cfg.clone(),
        Err(_) => Config::default(),
    };
    args.apply_overrides(&mut config);

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = if args.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("APELIOS_LOG").unwrap_or(log_level))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("apelios-core v{}", env!("CARGO_PKG_VERSION"));
    match config_result {
        Ok(_) => info!("Loaded configuration from {:?}", args.config),
        Err(e) => warn!("Failed to load config: {}, using defaults", e),
    }

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    match args.command {
        Command::Relay => {
            let server_config = RelayServerConfig {
                host: config.signaling.host.clone(),
                port: config.signaling.port,
                handshake_timeout: config.signaling.handshake_timeout(),
            };
            let relay = Arc::new(Relay::new());
            tokio::select! {
                result = run_relay_server(server_config, relay) => result?,
                _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
            }
        }
        Command::Send { .. } => run_sender(&config).await?,
        Command::Receive { .. } => {
            let report = run_receiver(&config).await?;
            if report.reason == StopReason::BudgetExhausted {
                warn!("Stream stalled; {} frames received", report.frames);
            }
        }
    }

    info!("apelios-core stopped");
    Ok(())
}
