//! Signaling relay registry
//!
//! Holds the one sender handle and the set of receiver handles, and routes
//! messages between them by role and kind. Handles are outbound queues of
//! connection writer tasks, so every send is non-blocking and all routing
//! happens under the registry lock without awaiting.

use super::codec::{Role, SignalingMessage};
use super::SignalingError;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Outbound side of one peer connection
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

impl PeerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a text frame for the peer
    pub fn send(&self, text: String) -> Result<(), SignalingError> {
        self.tx.send(text).map_err(|_| SignalingError::TransportClosed)
    }
}

impl PartialEq for PeerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerHandle {}

/// Snapshot of the registry for health reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub sender_connected: bool,
    pub receivers: usize,
}

#[derive(Default)]
struct RelayRegistry {
    sender: Option<PeerHandle>,
    receivers: BTreeMap<u64, PeerHandle>,
}

/// One-sender, many-receiver signaling relay
pub struct Relay {
    registry: Mutex<RelayRegistry>,
    next_peer_id: AtomicU64,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

impl Relay {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(RelayRegistry::default()),
            next_peer_id: AtomicU64::new(1),
        }
    }

    /// Allocate a handle for a new connection's outbound queue
    pub fn handle(&self, tx: mpsc::UnboundedSender<String>) -> PeerHandle {
        PeerHandle {
            id: self.next_peer_id.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Register a connection under its announced role.
    ///
    /// A second sender is rejected with `DuplicateSender`; the registered one
    /// keeps its place. A receiver that registers while a sender is present
    /// triggers an offer request tagged with the receiver's peer id, and a
    /// sender that registers late gets one request per waiting receiver.
    pub fn register(&self, role: Role, handle: PeerHandle) -> Result<(), SignalingError> {
        let mut registry = self.registry.lock();
        match role {
            Role::Sender => {
                if let Some(ref existing) = registry.sender {
                    warn!(
                        "Rejecting sender {}: sender {} is already registered",
                        handle.id, existing.id
                    );
                    return Err(SignalingError::DuplicateSender);
                }
                info!("Sender {} registered", handle.id);
                let waiting: Vec<u64> = registry.receivers.keys().copied().collect();
                registry.sender = Some(handle);
                for peer_id in waiting {
                    Self::request_offer_locked(&mut registry, peer_id);
                }
            }
            Role::Receiver => {
                let peer_id = handle.id;
                registry.receivers.insert(peer_id, handle);
                info!(
                    "Receiver {} registered ({} receiver(s))",
                    peer_id,
                    registry.receivers.len()
                );
                Self::request_offer_locked(&mut registry, peer_id);
            }
        }
        Ok(())
    }

    /// Ask the sender for a fresh offer aimed at `peer_id`
    pub fn request_offer(&self, peer_id: u64) -> bool {
        let mut registry = self.registry.lock();
        Self::request_offer_locked(&mut registry, peer_id)
    }

    fn request_offer_locked(registry: &mut RelayRegistry, peer_id: u64) -> bool {
        let Some(sender) = registry.sender.as_ref() else {
            debug!("No sender registered; receiver {} waits for one", peer_id);
            return false;
        };
        let text = match SignalingMessage::request_offer(Some(peer_id)).encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode offer request: {}", e);
                return false;
            }
        };
        if sender.send(text).is_err() {
            warn!("Could not request offer from sender {}", sender.id);
            registry.sender = None;
            return false;
        }
        debug!("Requested offer for receiver {}", peer_id);
        true
    }

    /// Deliver an offer to receivers and return how many accepted it.
    ///
    /// Offers tagged with a peer id go to that receiver only; untagged
    /// offers are broadcast. A receiver whose queue is gone is dropped from
    /// the registry without affecting delivery to the others.
    pub fn route_offer(&self, message: &SignalingMessage) -> usize {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode offer: {}", e);
                return 0;
            }
        };

        let mut registry = self.registry.lock();
        let targets: Vec<u64> = match message.routing().peer_id {
            Some(peer_id) if registry.receivers.contains_key(&peer_id) => vec![peer_id],
            Some(peer_id) => {
                debug!("Offer targets receiver {} which is gone", peer_id);
                return 0;
            }
            None => registry.receivers.keys().copied().collect(),
        };

        info!("Forwarding offer to {} receiver(s)", targets.len());
        let mut delivered = 0;
        let mut dead = Vec::new();
        for peer_id in targets {
            if let Some(receiver) = registry.receivers.get(&peer_id) {
                match receiver.send(text.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => dead.push(peer_id),
                }
            }
        }
        for peer_id in dead {
            warn!("Dropping dead receiver {}", peer_id);
            registry.receivers.remove(&peer_id);
        }
        delivered
    }

    /// Forward a receiver's answer to the sender, stamped with the
    /// receiver's peer id. Returns false when there is no live sender.
    pub fn route_answer(&self, from: &PeerHandle, message: &SignalingMessage) -> bool {
        let text = match message.clone().with_peer_id(from.id).encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode answer: {}", e);
                return false;
            }
        };

        let mut registry = self.registry.lock();
        let Some(sender) = registry.sender.as_ref() else {
            warn!("Dropping answer from receiver {}: no sender registered", from.id);
            return false;
        };
        if sender.send(text).is_err() {
            warn!("Could not forward answer to sender {}", sender.id);
            registry.sender = None;
            return false;
        }
        info!("Forwarded answer from receiver {} to sender", from.id);
        true
    }

    /// Remove a handle from whichever registry holds it
    pub fn unregister(&self, handle: &PeerHandle) -> bool {
        let mut registry = self.registry.lock();
        if registry.sender.as_ref() == Some(handle) {
            registry.sender = None;
            info!("Sender {} disconnected", handle.id);
            return true;
        }
        if registry.receivers.remove(&handle.id).is_some() {
            info!("Receiver {} disconnected", handle.id);
            return true;
        }
        false
    }

    pub fn stats(&self) -> RelayStats {
        let registry = self.registry.lock();
        RelayStats {
            sender_connected: registry.sender.is_some(),
            receivers: registry.receivers.len(),
        }
    }
}
