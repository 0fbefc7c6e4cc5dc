//! `receive` command: answer one offer and drain the video track to a file

use crate::config::Config;
use crate::media::{FrameIngestionPump, PumpReport, QueuedSink};
use crate::peer::PeerCapability;
use crate::rtc::{RemoteTrackSource, RtcPeer, RtcPeerFactory};
use crate::signaling::{
    Inbound, Role, Routing, SdpKind, SessionDescription, SignalingClient, SignalingError,
};
use crate::watchdog::Watchdog;
use log::{debug, info, warn};
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

const OFFER_POLL: Duration = Duration::from_secs(1);

fn open_output(config: &Config) -> std::io::Result<Box<dyn Write + Send>> {
    let path = &config.receiver.output;
    if path.as_os_str() == "-" {
        Ok(Box::new(BufWriter::new(std::io::stdout())))
    } else {
        info!("Writing received video to {:?}", path);
        Ok(Box::new(BufWriter::new(std::fs::File::create(path)?)))
    }
}

/// Wait for an offer, checking `running` between polls
async fn wait_for_offer(
    client: &SignalingClient,
    running: &AtomicBool,
) -> Result<(SessionDescription, Routing), SignalingError> {
    info!("Waiting for offer...");
    while running.load(Ordering::Acquire) {
        match client.receive_timeout(OFFER_POLL).await {
            Ok(Inbound::Description {
                description,
                routing,
            }) if description.kind == SdpKind::Offer => {
                info!("Offer received (session {:?})", routing.session_id);
                return Ok((description, routing));
            }
            Ok(Inbound::EndOfStream) => return Err(SignalingError::TransportClosed),
            Ok(other) => debug!("Ignoring {:?} while waiting for offer", other),
            Err(SignalingError::Timeout(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Err(SignalingError::TransportClosed)
}

async fn receive(
    config: &Config,
    client: &SignalingClient,
    peer: &RtcPeer,
    watchdog: &Arc<Watchdog>,
) -> Result<PumpReport, Box<dyn std::error::Error>> {
    let running = watchdog.running();
    let (offer, routing) = wait_for_offer(client, &running).await?;

    peer.set_remote_description(&offer).await?;
    let answer = peer.create_answer().await?;
    let answer = peer.set_local_description(&answer).await?;
    let echo = Routing {
        session_id: routing.session_id,
        peer_id: None,
    };
    client.send_tagged(&answer, echo).await?;
    info!("Answer sent");

    let connect_timeout = config.receiver.connect_timeout();
    watchdog.wait_connected(connect_timeout).await?;
    let track = peer
        .next_video_track(connect_timeout)
        .await
        .ok_or("no video track received")?;
    info!("Receiving video track {}", track.id());

    let sink = QueuedSink::spawn(config.receiver.queue_capacity, open_output(config)?)?;
    let report = FrameIngestionPump::new(RemoteTrackSource::new(track), running)
        .with_budget(config.receiver.error_budget())
        .with_display(Box::new(sink))
        .run()
        .await;
    Ok(report)
}

/// Run one receiver until the stream ends or Ctrl+C
pub async fn run_receiver(config: &Config) -> Result<PumpReport, Box<dyn std::error::Error>> {
    let client = SignalingClient::connect(&config.signaling.url(), Role::Receiver).await?;
    let factory = RtcPeerFactory::new(config.webrtc.clone());
    let peer = match factory.create_peer_connection().await {
        Ok(peer) => peer,
        Err(e) => {
            client.close().await;
            return Err(e.into());
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let watchdog = Watchdog::new(running.clone());
    peer.observe(watchdog.clone());

    let stopper = running.clone();
    let shutdown = tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("Shutdown signal received");
        stopper.store(false, Ordering::Release);
    });

    let result = receive(config, &client, &peer, &watchdog).await;

    shutdown.abort();
    running.store(false, Ordering::Release);
    if let Err(e) = peer.close().await {
        warn!("{}", e);
    }
    client.close().await;

    match &result {
        Ok(report) => info!("Receiver stopped: {:?}", report),
        Err(e) => warn!("Receiver stopped: {}", e),
    }
    result
}
