//! Relay transport.
//!
//! Provides:
//! - Wire protocol (JSON, one object per frame)
//! - Consumer registry with per-consumer bounded queues
//! - WebSocket relay server (feature: websocket)

pub mod consumer;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod server;

pub use consumer::{ChannelConsumer, Consumer, ConsumerId, ConsumerRegistry, DeliveryError};
pub use protocol::{ClientMessage, ServerMessage};
#[cfg(feature = "websocket")]
pub use server::{RelayError, RelayServer};
