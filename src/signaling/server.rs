//! Signaling relay WebSocket server
//!
//! Every peer connects to the same endpoint and announces its role with the
//! first text frame. From then on:
//! 1. Sender offers are forwarded to receivers
//! 2. Receiver answers are forwarded to the sender
//! 3. A receiver joining triggers an offer request to the sender

use super::codec::{MessageKind, Role, SignalingMessage};
use super::relay::{PeerHandle, Relay};
use super::SignalingError;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Time a new connection has to announce its role
    pub handshake_timeout: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9999,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
struct RelayState {
    relay: Arc<Relay>,
    handshake_timeout: Duration,
}

/// Build the relay router: WebSocket signaling on `/` and `/signaling`,
/// registry snapshot on `/health`.
pub fn router(relay: Arc<Relay>, handshake_timeout: Duration) -> Router {
    let state = RelayState {
        relay,
        handshake_timeout,
    };
    Router::new()
        .route("/", get(signaling_handler))
        .route("/signaling", get(signaling_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve the relay on an already bound listener
pub async fn serve(
    listener: TcpListener,
    relay: Arc<Relay>,
    handshake_timeout: Duration,
) -> std::io::Result<()> {
    axum::serve(listener, router(relay, handshake_timeout)).await
}

/// Bind and run the relay until the server fails
pub async fn run_relay_server(
    config: RelayServerConfig,
    relay: Arc<Relay>,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Signaling relay listening on ws://{}", addr);
    serve(listener, relay, config.handshake_timeout)
        .await
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;
    Ok(())
}

async fn signaling_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_relay_connection(socket, state.relay, state.handshake_timeout))
}

async fn health_handler(State(state): State<RelayState>) -> Json<serde_json::Value> {
    let stats = state.relay.stats();
    Json(serde_json::json!({
        "status": "healthy",
        "sender_connected": stats.sender_connected,
        "receivers": stats.receivers,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Handle one relay WebSocket connection from handshake to disconnect
pub async fn handle_relay_connection(
    socket: WebSocket,
    relay: Arc<Relay>,
    handshake_timeout: Duration,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let handle = relay.handle(tx);

    let role = match tokio::time::timeout(handshake_timeout, next_text(&mut ws_receiver)).await {
        Ok(Some(text)) => match SignalingMessage::decode(&text) {
            Ok(msg) if msg.kind() == MessageKind::Identify => msg.role(),
            Ok(msg) => {
                warn!("Peer {} skipped role announcement (sent {:?})", handle.id(), msg.kind());
                send_task.abort();
                return;
            }
            Err(e) => {
                warn!("Peer {} sent an invalid role announcement: {}", handle.id(), e);
                send_task.abort();
                return;
            }
        },
        Ok(None) => {
            debug!("Peer {} disconnected before announcing a role", handle.id());
            send_task.abort();
            return;
        }
        Err(_) => {
            warn!("Peer {} did not announce a role within {:?}", handle.id(), handshake_timeout);
            send_task.abort();
            return;
        }
    };

    if let Err(e) = relay.register(role, handle.clone()) {
        warn!("Closing peer {}: {}", handle.id(), e);
        // Dropping the last queue handle lets the writer close the socket.
        drop(handle);
        let _ = send_task.await;
        return;
    }

    while let Some(text) = next_text(&mut ws_receiver).await {
        match SignalingMessage::decode(&text) {
            Ok(msg) => dispatch(&relay, role, &handle, msg),
            Err(e) => warn!("Dropping message from {} {}: {}", role, handle.id(), e),
        }
    }

    relay.unregister(&handle);
    send_task.abort();
    info!("Relay connection finished ({} {})", role, handle.id());
}

fn dispatch(relay: &Relay, role: Role, from: &PeerHandle, msg: SignalingMessage) {
    match (role, msg.kind()) {
        (Role::Sender, MessageKind::Offer) => {
            relay.route_offer(&msg);
        }
        (Role::Receiver, MessageKind::Answer) => {
            relay.route_answer(from, &msg);
        }
        (Role::Receiver, MessageKind::RequestOffer) => {
            relay.request_offer(from.id());
        }
        (_, MessageKind::Identify) => {
            debug!("Ignoring repeated role announcement from {} {}", role, from.id());
        }
        (role, kind) => {
            let violation = SignalingError::ProtocolViolation(format!("{:?} from {}", kind, role));
            warn!("Dropping message from peer {}: {}", from.id(), violation);
        }
    }
}

async fn next_text(ws_receiver: &mut SplitStream<WebSocket>) -> Option<String> {
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => return Some(text.as_str().to_string()),
            Ok(Message::Binary(_)) => debug!("Ignoring binary frame on signaling channel"),
            Ok(Message::Close(_)) => return None,
            Ok(_) => {}
            Err(e) => {
                error!("WebSocket error: {}", e);
                return None;
            }
        }
    }
    None
}
