//! Core abstractions for the messaging bridge.
//!
//! This crate provides the fundamental building blocks:
//! - `EventBus` - Live broadcast of bridge events (no replay)
//! - `ConnectionState` - The connection lifecycle state machine
//! - `normalize` - Raw event to `InboundMessage` extraction
//! - `BridgeConfig` - Environment-driven configuration
//! - Connector, store and bridge traits

pub mod config;
pub mod event_bus;
pub mod normalize;
pub mod raw;
pub mod state;
pub mod traits;
pub mod types;

pub use config::BridgeConfig;
pub use event_bus::EventBus;
pub use state::{CloseAction, CloseReason, ConnectionState};
pub use traits::{Bridge, SessionConnector, SessionHandle, SessionStore};
pub use types::{BridgeEvent, InboundMessage, LinkStatus, OutboundCommand, SessionState};
