//! Core traits for the external session, credential storage and the bridge.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::{
    raw::{RawEvent, UpsertKind},
    state::{CloseReason, ConnectionState},
    types::{BridgeEvent, OutboundCommand, SessionState},
};

/// Protocol version of the external platform (e.g. `2.3000.1015901307`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion(pub [u32; 3]);

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [major, minor, patch] = self.0;
        write!(f, "{major}.{minor}.{patch}")
    }
}

/// Options for opening an external session.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Stored credentials; empty triggers a QR challenge.
    pub state: SessionState,
    /// Negotiated protocol version, if any.
    pub version: Option<ProtocolVersion>,
}

/// Low-level notification from the external session.
#[derive(Debug, Clone)]
pub enum Notification {
    /// QR challenge issued.
    Qr(String),
    /// Session authenticated and open.
    Open { own_id: Option<String> },
    /// Credentials rotated; must be persisted.
    CredsUpdated(SessionState),
    /// Batch of raw inbound events.
    Messages {
        kind: UpsertKind,
        events: Vec<RawEvent>,
    },
    /// Session closed.
    Close(CloseReason),
}

/// External session error.
#[derive(Debug, Error)]
pub enum ExternalError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Session closed")]
    Closed,
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Handle to one open external session.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    /// Send a text message.
    async fn send_text(&self, to: &str, text: &str) -> Result<(), ExternalError>;

    /// Close the session. Must be safe to call more than once.
    async fn close(&self);
}

/// An opened session: the command handle plus its notification stream.
pub struct Connection {
    /// Command handle.
    pub handle: Arc<dyn SessionHandle>,
    /// Notifications; the stream ending means the session is gone.
    pub notifications: mpsc::Receiver<Notification>,
}

/// Capability that opens external sessions.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Negotiate the protocol version to use. `None` lets the session pick.
    async fn negotiate_version(&self) -> Result<Option<ProtocolVersion>, ExternalError> {
        Ok(None)
    }

    /// Open a new session.
    async fn connect(&self, options: ConnectOptions) -> Result<Connection, ExternalError>;
}

/// Session store error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage path already in use: {0}")]
    PathInUse(String),
}

/// Result of loading stored credentials. Loading never fails outright.
#[derive(Debug, Default)]
pub struct Loaded {
    /// Loaded state, or empty.
    pub state: SessionState,
    /// Set when storage was unreadable and `state` fell back to empty.
    pub warning: Option<StoreError>,
}

/// Trait for credential storage backends.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the stored state; absent or unreadable storage yields empty.
    async fn load(&self) -> Loaded;

    /// Persist the state atomically.
    async fn save(&self, state: &SessionState) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: SessionStore + ?Sized> SessionStore for Arc<T> {
    async fn load(&self) -> Loaded {
        (**self).load().await
    }

    async fn save(&self, state: &SessionState) -> Result<(), StoreError> {
        (**self).save(state).await
    }
}

#[async_trait]
impl<T: SessionConnector + ?Sized> SessionConnector for Arc<T> {
    async fn negotiate_version(&self) -> Result<Option<ProtocolVersion>, ExternalError> {
        (**self).negotiate_version().await
    }

    async fn connect(&self, options: ConnectOptions) -> Result<Connection, ExternalError> {
        (**self).connect(options).await
    }
}

/// Error returned by [`Bridge::send`].
#[derive(Debug, Error)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    External(#[from] ExternalError),
}

/// Bridge lifecycle error.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Bridge already started")]
    AlreadyStarted,
    #[error("Bridge stopped")]
    Stopped,
}

/// The bridge as seen by the relay: lifecycle, commands, events.
#[async_trait]
pub trait Bridge: Send + Sync {
    /// Start the external session.
    async fn start(&self) -> Result<(), BridgeError>;

    /// Execute a send command against the external session.
    async fn send(&self, command: OutboundCommand) -> Result<(), SendError>;

    /// Subscribe to future events.
    fn subscribe(&self) -> broadcast::Receiver<BridgeEvent>;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Stop the bridge. Idempotent.
    async fn stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_connected_message() {
        assert_eq!(SendError::NotConnected.to_string(), "not connected");
    }

    #[test]
    fn test_version_display_and_wire() {
        let version = ProtocolVersion([2, 3000, 1_015_901_307]);
        assert_eq!(version.to_string(), "2.3000.1015901307");
        assert_eq!(
            serde_json::to_string(&version).unwrap(),
            "[2,3000,1015901307]"
        );
    }
}
