//! Signaling wire codec
//!
//! Messages travel as JSON text frames:
//! - Role announcement (first frame of every peer): `{"type": "sender"}`
//! - Description: `{"type": "sender", "message_type": "offer", "sdp": "...", "session_id": 1}`
//! - Offer request: `{"type": "receiver", "message_type": "request_offer", "peer_id": 7}`
//!
//! `session_id` and `peer_id` are routing tags. Peers that do not know about
//! them simply omit them.

use super::SignalingError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity a peer declares on first contact with the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The single video source
    Sender,
    /// A viewer
    Receiver,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }

    fn parse(value: &str) -> Result<Self, SignalingError> {
        match value {
            "sender" => Ok(Role::Sender),
            "receiver" => Ok(Role::Receiver),
            other => Err(SignalingError::ProtocolViolation(format!(
                "unknown role: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discriminant of a signaling message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Offer,
    Answer,
    RequestOffer,
    Identify,
}

impl MessageKind {
    fn wire_name(&self) -> Option<&'static str> {
        match self {
            MessageKind::Offer => Some("offer"),
            MessageKind::Answer => Some("answer"),
            MessageKind::RequestOffer => Some("request_offer"),
            MessageKind::Identify => None,
        }
    }
}

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }

    fn message_kind(&self) -> MessageKind {
        match self {
            SdpKind::Offer => MessageKind::Offer,
            SdpKind::Answer => MessageKind::Answer,
        }
    }
}

/// Opaque negotiation payload produced by a peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Routing tags carried next to a description.
///
/// `session_id` is allocated by the sender and echoed back by the receiver
/// that answers; `peer_id` is allocated by the relay for each receiver
/// connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Routing {
    pub session_id: Option<u64>,
    pub peer_id: Option<u64>,
}

impl Routing {
    pub fn session(session_id: u64) -> Self {
        Self {
            session_id: Some(session_id),
            peer_id: None,
        }
    }
}

/// A validated signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    role: Role,
    kind: MessageKind,
    description: Option<SessionDescription>,
    routing: Routing,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    peer_id: Option<u64>,
}

impl SignalingMessage {
    /// Role announcement sent right after connecting
    pub fn identify(role: Role) -> Self {
        Self {
            role,
            kind: MessageKind::Identify,
            description: None,
            routing: Routing::default(),
        }
    }

    /// Offer request issued by the relay on behalf of a receiver
    pub fn request_offer(peer_id: Option<u64>) -> Self {
        Self {
            role: Role::Receiver,
            kind: MessageKind::RequestOffer,
            description: None,
            routing: Routing {
                session_id: None,
                peer_id,
            },
        }
    }

    /// Offer or answer, depending on the description kind
    pub fn description(role: Role, description: SessionDescription) -> Self {
        Self {
            role,
            kind: description.kind.message_kind(),
            description: Some(description),
            routing: Routing::default(),
        }
    }

    pub fn with_routing(mut self, routing: Routing) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_peer_id(mut self, peer_id: u64) -> Self {
        self.routing.peer_id = Some(peer_id);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn sdp_description(&self) -> Option<&SessionDescription> {
        self.description.as_ref()
    }

    pub fn into_description(self) -> Option<(SessionDescription, Routing)> {
        let routing = self.routing;
        self.description.map(|d| (d, routing))
    }

    pub fn routing(&self) -> Routing {
        self.routing
    }

    /// Serialize to a JSON text frame
    pub fn encode(&self) -> Result<String, SignalingError> {
        let wire = WireMessage {
            role: Some(self.role.as_str().to_string()),
            message_type: self.kind.wire_name().map(str::to_string),
            sdp: self.description.as_ref().map(|d| d.sdp.clone()),
            session_id: self.routing.session_id,
            peer_id: self.routing.peer_id,
        };
        serde_json::to_string(&wire).map_err(|e| {
            SignalingError::ProtocolViolation(format!("failed to serialize message: {}", e))
        })
    }

    /// Parse and validate a JSON text frame
    pub fn decode(text: &str) -> Result<Self, SignalingError> {
        let wire: WireMessage = serde_json::from_str(text).map_err(|e| {
            SignalingError::ProtocolViolation(format!("invalid signaling message: {}", e))
        })?;
        let role = wire.role.as_deref().map(Role::parse).transpose()?;
        let routing = Routing {
            session_id: wire.session_id,
            peer_id: wire.peer_id,
        };

        let Some(message_type) = wire.message_type.as_deref() else {
            let role = role.ok_or_else(|| {
                SignalingError::ProtocolViolation("role announcement without type".to_string())
            })?;
            return Ok(Self::identify(role));
        };

        match message_type {
            "offer" | "answer" => {
                let role = role.ok_or_else(|| {
                    SignalingError::ProtocolViolation(format!("{} without type", message_type))
                })?;
                let sdp = wire.sdp.ok_or_else(|| {
                    SignalingError::ProtocolViolation(format!("{} without sdp", message_type))
                })?;
                let description = if message_type == "offer" {
                    SessionDescription::offer(sdp)
                } else {
                    SessionDescription::answer(sdp)
                };
                Ok(Self::description(role, description).with_routing(routing))
            }
            // The relay does not always tag its requests with a role.
            "request_offer" => Ok(Self {
                role: role.unwrap_or(Role::Receiver),
                kind: MessageKind::RequestOffer,
                description: None,
                routing,
            }),
            other => Err(SignalingError::ProtocolViolation(format!(
                "unknown message_type: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_omits_message_type() {
        let json = SignalingMessage::identify(Role::Receiver).encode().unwrap();
        assert_eq!(json, r#"{"type":"receiver"}"#);
    }

    #[test]
    fn decode_untagged_offer() {
        let msg = SignalingMessage::decode(
            r#"{"type": "sender", "message_type": "offer", "sdp": "v=0\r\n"}"#,
        )
        .unwrap();
        assert_eq!(msg.role(), Role::Sender);
        assert_eq!(msg.kind(), MessageKind::Offer);
        assert_eq!(msg.routing(), Routing::default());
        assert!(msg.sdp_description().unwrap().sdp.starts_with("v=0"));
    }

    #[test]
    fn answer_keeps_routing_tags() {
        let msg = SignalingMessage::description(Role::Receiver, SessionDescription::answer("v=0"))
            .with_routing(Routing::session(3))
            .with_peer_id(9);
        let json = msg.encode().unwrap();
        assert!(json.contains(r#""message_type":"answer""#));

        let decoded = SignalingMessage::decode(&json).unwrap();
        assert_eq!(decoded.routing().session_id, Some(3));
        assert_eq!(decoded.routing().peer_id, Some(9));
        assert_eq!(decoded, msg);
    }

    #[test]
    fn bare_request_offer_is_accepted() {
        let msg = SignalingMessage::decode(r#"{"message_type": "request_offer"}"#).unwrap();
        assert_eq!(msg.kind(), MessageKind::RequestOffer);
        assert_eq!(msg.routing().peer_id, None);
    }

    #[test]
    fn unknown_kind_is_protocol_violation() {
        let err = SignalingMessage::decode(r#"{"type": "sender", "message_type": "bye"}"#)
            .unwrap_err();
        assert!(matches!(err, SignalingError::ProtocolViolation(_)));
    }

    #[test]
    fn offer_without_sdp_is_rejected() {
        let err = SignalingMessage::decode(r#"{"type": "sender", "message_type": "offer"}"#)
            .unwrap_err();
        assert!(matches!(err, SignalingError::ProtocolViolation(_)));
    }

    #[test]
    fn unknown_role_is_rejected() {
        assert!(SignalingMessage::decode(r#"{"type": "viewer"}"#).is_err());
        assert!(SignalingMessage::decode("not json").is_err());
    }
}
