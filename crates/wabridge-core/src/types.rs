//! Bridge data model.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque credential and key material for one bridge identity.
///
/// An empty blob means the identity is not yet authenticated, which makes
/// the external session issue a QR challenge.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    blob: Vec<u8>,
}

impl SessionState {
    /// Create an empty (unauthenticated) state.
    #[must_use]
    pub const fn empty() -> Self {
        Self { blob: Vec::new() }
    }

    /// Wrap a persisted blob.
    #[must_use]
    pub const fn from_bytes(blob: Vec<u8>) -> Self {
        Self { blob }
    }

    /// Raw bytes of the blob.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.blob
    }

    /// Consume the state, returning its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.blob
    }

    /// Whether the state holds no credentials.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blob.is_empty()
    }
}

// Key material stays out of logs.
impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("len", &self.blob.len())
            .finish()
    }
}

/// Canonical inbound message produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    /// Platform message identifier.
    pub id: String,
    /// Conversation address the message arrived on.
    pub sender: String,
    /// Extracted text content.
    pub content: String,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    /// Whether the conversation is a group.
    pub is_group: bool,
    /// Sender display name, if the platform supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    /// Author address inside a group conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
}

/// Command issued by a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundCommand {
    /// Destination address.
    pub to: String,
    /// Message text.
    pub text: String,
}

impl OutboundCommand {
    /// Create a send command.
    #[must_use]
    pub fn send(to: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            text: text.into(),
        }
    }
}

/// Link status reported to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

/// Event emitted by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// A normalized inbound message.
    Message(InboundMessage),
    /// Connection status change.
    Status(LinkStatus),
    /// QR challenge to be scanned out of band.
    Qr(String),
    /// Non-fatal error.
    Error(String),
    /// Send acknowledgement (per-consumer reply only).
    Ack { to: String },
}

impl BridgeEvent {
    /// Short name for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Status(_) => "status",
            Self::Qr(_) => "qr",
            Self::Error(_) => "error",
            Self::Ack { .. } => "ack",
        }
    }
}
