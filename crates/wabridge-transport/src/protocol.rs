//! Wire protocol between consumers and the relay.

use serde::{Deserialize, Serialize};
use wabridge_core::{BridgeEvent, InboundMessage, LinkStatus, OutboundCommand};

/// Message from consumer to relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Send a text message through the bridge.
    Send { to: String, text: String },
}

impl ClientMessage {
    /// Parse a consumer frame.
    ///
    /// # Errors
    /// Returns error if the frame is not a known command.
    pub fn parse(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}

impl From<ClientMessage> for OutboundCommand {
    fn from(message: ClientMessage) -> Self {
        match message {
            ClientMessage::Send { to, text } => Self { to, text },
        }
    }
}

/// Message from relay to consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Normalized inbound message; fields are inlined next to `type`.
    Message(InboundMessage),
    /// Link status change.
    Status { status: LinkStatus },
    /// QR challenge.
    Qr { qr: String },
    /// Error, broadcast or as a reply.
    Error { error: String },
    /// Send acknowledgement (reply only).
    Sent { to: String },
}

impl ServerMessage {
    /// Create an error message.
    #[must_use]
    pub fn error(error: impl ToString) -> Self {
        Self::Error {
            error: error.to_string(),
        }
    }

    /// Encode as a JSON frame.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<BridgeEvent> for ServerMessage {
    fn from(event: BridgeEvent) -> Self {
        match event {
            BridgeEvent::Message(message) => Self::Message(message),
            BridgeEvent::Status(status) => Self::Status { status },
            BridgeEvent::Qr(qr) => Self::Qr { qr },
            BridgeEvent::Error(error) => Self::Error { error },
            BridgeEvent::Ack { to } => Self::Sent { to },
        }
    }
}
