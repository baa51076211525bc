//! Connection lifecycle state machine.
//!
//! ```text
//! disconnected -> connecting -> (qr_pending) -> connected
//! connected -> reconnecting -> connecting
//! any non-stopped state -> stopped
//! ```
//!
//! `Stopped` is absorbing. `Reconnecting` doubles as the single-flight guard:
//! while in it, further close notifications are ignored.

use serde::{Deserialize, Serialize};

use crate::types::LinkStatus;

/// Connection state of the external session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not started yet.
    Disconnected,
    /// Opening the external session.
    Connecting,
    /// Waiting for the QR challenge to be scanned.
    QrPending,
    /// Session open; sends are allowed.
    Connected,
    /// Transient loss; a reconnect is scheduled.
    Reconnecting,
    /// Terminal.
    Stopped,
}

/// Why the external session closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Credentials were invalidated remotely.
    LoggedOut,
    /// Anything else (network drop, restart request, stream error).
    Other(String),
}

impl CloseReason {
    /// Whether the close is terminal.
    #[must_use]
    pub const fn is_logout(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

/// What the manager should do with a close notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Enter `Reconnecting` and schedule one reconnect.
    Reconnect,
    /// Enter `Stopped`; never reconnect.
    Terminate,
    /// A reconnect is already scheduled, or the manager is stopped.
    Ignore,
}

impl ConnectionState {
    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Stopped, _) => false,
            (_, Self::Stopped)
            | (Self::Disconnected | Self::Reconnecting, Self::Connecting)
            | (Self::Connecting | Self::QrPending, Self::QrPending | Self::Connected)
            | (Self::Connecting | Self::QrPending | Self::Connected, Self::Reconnecting) => true,
            _ => false,
        }
    }

    /// Decide how to react to a close notification in this state.
    #[must_use]
    pub const fn close_action(self, reason: &CloseReason) -> CloseAction {
        match self {
            Self::Stopped => CloseAction::Ignore,
            _ if reason.is_logout() => CloseAction::Terminate,
            Self::Reconnecting | Self::Disconnected => CloseAction::Ignore,
            Self::Connecting | Self::QrPending | Self::Connected => CloseAction::Reconnect,
        }
    }

    /// Whether commands may be sent.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether the state is terminal.
    #[must_use]
    pub const fn is_stopped(self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Status as reported to consumers.
    #[must_use]
    pub const fn link_status(self) -> LinkStatus {
        if self.is_connected() {
            LinkStatus::Connected
        } else {
            LinkStatus::Disconnected
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::QrPending => "qr_pending",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
