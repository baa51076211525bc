//! Helper process wire format: one JSON object per line.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use wabridge_core::{
    CloseReason, SessionState,
    raw::{RawEvent, UpsertKind},
    traits::{Notification, ProtocolVersion},
};

/// Close reason the helper reports when credentials were invalidated.
pub const LOGGED_OUT: &str = "logged_out";

/// Message from the bridge to the helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeRequest {
    /// Open the session with stored credentials (base64, empty for none).
    Start {
        creds: String,
        version: Option<ProtocolVersion>,
    },
    /// Send a text message; answered by `sent` or `send_error` with the same id.
    Send { id: u64, to: String, text: String },
    /// Close the session.
    Close,
}

impl BridgeRequest {
    /// Create a start request from stored credentials.
    #[must_use]
    pub fn start(state: &SessionState, version: Option<ProtocolVersion>) -> Self {
        Self::Start {
            creds: BASE64.encode(state.as_bytes()),
            version,
        }
    }
}

/// Message from the helper to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperMessage {
    Qr {
        qr: String,
    },
    Open {
        #[serde(default)]
        me: Option<String>,
    },
    Creds {
        creds: String,
    },
    Messages {
        #[serde(default)]
        upsert: UpsertKind,
        #[serde(default)]
        messages: Vec<Value>,
    },
    Close {
        #[serde(default)]
        reason: String,
    },
    Sent {
        id: u64,
    },
    SendError {
        id: u64,
        error: String,
    },
}

/// What a helper line means to the bridge.
#[derive(Debug)]
pub enum Decoded {
    /// Forward to the connection manager.
    Notify(Notification),
    /// Reply to an outstanding send.
    Reply { id: u64, result: Result<(), String> },
    /// Nothing to do.
    Ignore,
}

impl HelperMessage {
    /// Interpret a helper message.
    #[must_use]
    pub fn decode(self) -> Decoded {
        match self {
            Self::Qr { qr } => Decoded::Notify(Notification::Qr(qr)),
            Self::Open { me } => Decoded::Notify(Notification::Open { own_id: me }),
            Self::Creds { creds } => match BASE64.decode(creds.as_bytes()) {
                Ok(bytes) => Decoded::Notify(Notification::CredsUpdated(SessionState::from_bytes(
                    bytes,
                ))),
                Err(e) => {
                    tracing::warn!(error = %e, "helper sent undecodable credentials");
                    Decoded::Ignore
                }
            },
            Self::Messages { upsert, messages } => {
                let events: Vec<RawEvent> = messages
                    .into_iter()
                    .filter_map(|value| match serde_json::from_value(value) {
                        Ok(event) => Some(event),
                        Err(e) => {
                            tracing::debug!(error = %e, "skipping malformed raw event");
                            None
                        }
                    })
                    .collect();
                Decoded::Notify(Notification::Messages {
                    kind: upsert,
                    events,
                })
            }
            Self::Close { reason } => {
                let reason = if reason == LOGGED_OUT {
                    CloseReason::LoggedOut
                } else {
                    CloseReason::Other(reason)
                };
                Decoded::Notify(Notification::Close(reason))
            }
            Self::Sent { id } => Decoded::Reply { id, result: Ok(()) },
            Self::SendError { id, error } => Decoded::Reply {
                id,
                result: Err(error),
            },
        }
    }
}

/// Parse and interpret one helper line.
#[must_use]
pub fn decode_line(line: &str) -> Decoded {
    match serde_json::from_str::<HelperMessage>(line) {
        Ok(message) => message.decode(),
        Err(e) => {
            tracing::debug!(error = %e, line, "unrecognized helper line");
            Decoded::Ignore
        }
    }
}
