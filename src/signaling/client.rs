//! Signaling client
//!
//! Per-peer proxy over a WebSocket connection to the relay. Connecting sends
//! the role announcement and starts a background pump that classifies every
//! inbound frame into a queue read by [`SignalingClient::receive`].

use super::codec::{MessageKind, Role, Routing, SessionDescription, SignalingMessage};
use super::SignalingError;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Item produced by the receive pump
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Offer or answer, with the routing tags it arrived with
    Description {
        description: SessionDescription,
        routing: Routing,
    },
    /// The relay asks the sender for a new offer
    RequestOffer { peer_id: Option<u64> },
    /// Transport closed; no further items follow
    EndOfStream,
}

/// Signaling operations the session layer depends on
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send a description tagged with routing information
    async fn send_description(
        &self,
        description: &SessionDescription,
        routing: Routing,
    ) -> Result<(), SignalingError>;

    /// Next inbound item; `EndOfStream` once the transport is gone
    async fn receive(&self) -> Inbound;

    /// Release the transport
    async fn close(&self);
}

/// WebSocket signaling client
pub struct SignalingClient {
    role: Role,
    url: String,
    writer: Mutex<Option<SplitSink<WsStream, Message>>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SignalingClient {
    /// Connect to the relay, announce `role` and start the receive pump
    pub async fn connect(url: &str, role: Role) -> Result<Self, SignalingError> {
        info!("Connecting to signaling server at {} as {}", url, role);
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| SignalingError::Transport(format!("{}: {}", url, e)))?;
        let (mut write, read) = stream.split();

        let hello = SignalingMessage::identify(role).encode()?;
        write
            .send(Message::Text(hello))
            .await
            .map_err(|_| SignalingError::TransportClosed)?;
        info!("Connected as {}", role);

        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(receive_pump(read, tx));

        Ok(Self {
            role,
            url: url.to_string(),
            writer: Mutex::new(Some(write)),
            inbound: Mutex::new(rx),
            pump: parking_lot::Mutex::new(Some(pump)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send an untagged description
    pub async fn send(&self, description: &SessionDescription) -> Result<(), SignalingError> {
        self.send_tagged(description, Routing::default()).await
    }

    /// Send a description with routing tags
    pub async fn send_tagged(
        &self,
        description: &SessionDescription,
        routing: Routing,
    ) -> Result<(), SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::TransportClosed);
        }
        let text = SignalingMessage::description(self.role, description.clone())
            .with_routing(routing)
            .encode()?;

        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(SignalingError::TransportClosed)?;
        sink.send(Message::Text(text))
            .await
            .map_err(|_| SignalingError::TransportClosed)?;
        debug!("Sent {}", description.kind.as_str());
        Ok(())
    }

    /// Pop the next inbound item. Always `EndOfStream` once closed.
    pub async fn receive(&self) -> Inbound {
        if self.is_closed() {
            return Inbound::EndOfStream;
        }
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await.unwrap_or(Inbound::EndOfStream)
    }

    /// Pop the next inbound item, failing with `Timeout` after `timeout`
    pub async fn receive_timeout(&self, timeout: Duration) -> Result<Inbound, SignalingError> {
        tokio::time::timeout(timeout, self.receive())
            .await
            .map_err(|_| SignalingError::Timeout(timeout))
    }

    /// Stop the receive pump and close the transport. Safe to call twice.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }

        if let Some(mut sink) = self.writer.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!("Error closing signaling transport: {}", e);
            }
        }
        info!("WebSocket signaling closed");
    }
}

#[async_trait]
impl SignalingChannel for SignalingClient {
    async fn send_description(
        &self,
        description: &SessionDescription,
        routing: Routing,
    ) -> Result<(), SignalingError> {
        self.send_tagged(description, routing).await
    }

    async fn receive(&self) -> Inbound {
        SignalingClient::receive(self).await
    }

    async fn close(&self) {
        SignalingClient::close(self).await
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

/// Classify a decoded message into a queue item
fn classify(message: SignalingMessage) -> Option<Inbound> {
    match message.kind() {
        MessageKind::Offer | MessageKind::Answer => {
            message
                .into_description()
                .map(|(description, routing)| Inbound::Description {
                    description,
                    routing,
                })
        }
        MessageKind::RequestOffer => Some(Inbound::RequestOffer {
            peer_id: message.routing().peer_id,
        }),
        MessageKind::Identify => {
            warn!("Unexpected role announcement from relay");
            None
        }
    }
}

async fn receive_pump(mut read: SplitStream<WsStream>, tx: mpsc::UnboundedSender<Inbound>) {
    while let Some(result) = read.next().await {
        match result {
            Ok(Message::Text(text)) => match SignalingMessage::decode(&text) {
                Ok(message) => {
                    if let Some(item) = classify(message) {
                        if tx.send(item).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!("Dropping signaling message: {}", e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Error in signaling receive loop: {}", e);
                break;
            }
        }
    }
    info!("WebSocket connection closed");
    let _ = tx.send(Inbound::EndOfStream);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_keeps_routing() {
        let msg = SignalingMessage::description(Role::Sender, SessionDescription::offer("v=0"))
            .with_routing(Routing {
                session_id: Some(2),
                peer_id: Some(5),
            });
        match classify(msg) {
            Some(Inbound::Description {
                description,
                routing,
            }) => {
                assert_eq!(description, SessionDescription::offer("v=0"));
                assert_eq!(routing.session_id, Some(2));
                assert_eq!(routing.peer_id, Some(5));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn classify_request_and_identify() {
        assert_eq!(
            classify(SignalingMessage::request_offer(Some(4))),
            Some(Inbound::RequestOffer { peer_id: Some(4) })
        );
        assert_eq!(classify(SignalingMessage::identify(Role::Sender)), None);
    }

    #[tokio::test]
    async fn connect_to_nothing_fails() {
        let err = SignalingClient::connect("ws://127.0.0.1:1", Role::Receiver)
            .await
            .err()
            .expect("connection refused");
        assert!(matches!(err, SignalingError::Transport(_)));
    }
}
