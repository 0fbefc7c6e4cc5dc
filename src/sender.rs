//! `send` command: one H.264 source fanned out to every receiver

use crate::config::Config;
use crate::rtc::{new_outgoing_video_track, spawn_h264_feeder, RtcPeerFactory};
use crate::session::SessionManager;
use crate::signaling::{Role, SignalingClient};
use log::{info, warn};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

/// Poll interval of the session control loop
const CONTROL_POLL: Duration = Duration::from_secs(1);

fn open_input(config: &Config) -> std::io::Result<Box<dyn Read + Send>> {
    let path = &config.sender.input;
    if path.as_os_str() == "-" {
        info!("Reading H.264 from stdin");
        Ok(Box::new(std::io::stdin()))
    } else {
        info!("Reading H.264 from {:?}", path);
        Ok(Box::new(std::fs::File::open(path)?))
    }
}

/// Serve offers until signaling ends or Ctrl+C
pub async fn run_sender(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let track = new_outgoing_video_track();
    let feeding = Arc::new(AtomicBool::new(true));
    let feeder = spawn_h264_feeder(
        track.clone(),
        open_input(config)?,
        config.sender.frame_duration(),
        feeding.clone(),
    );

    let client = SignalingClient::connect(&config.signaling.url(), Role::Sender).await?;
    let manager = SessionManager::new(
        RtcPeerFactory::new(config.webrtc.clone()),
        track,
        config.sender.max_sessions,
    )
    .with_offer_timeout(config.sender.offer_timeout());
    info!(
        "Sender ready, serving up to {} receivers",
        config.sender.max_sessions
    );

    let running = manager.running();
    let shutdown = tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("Shutdown signal received");
        running.store(false, Ordering::Release);
    });

    manager.run(&client, CONTROL_POLL).await;

    shutdown.abort();
    feeding.store(false, Ordering::Release);
    client.close().await;

    // A reader blocked on stdin is left behind rather than awaited.
    if feeder.is_finished() {
        match feeder.await {
            Ok(Ok(pictures)) => info!("Input finished after {} pictures", pictures),
            Ok(Err(e)) => warn!("Input feeder failed: {}", e),
            Err(e) => warn!("Input feeder task failed: {}", e),
        }
    }
    info!("Sender stopped");
    Ok(())
}
