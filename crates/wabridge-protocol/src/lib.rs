//! Helper-process session connector.
//!
//! Provides:
//! - Helper wire protocol (NDJSON + base64 credentials)
//! - `HelperPeer` - Request/reply and notification plumbing over stdio
//! - `ProcessConnector` - `SessionConnector` that spawns the helper
//! - Command building utilities

pub mod command;
pub mod connector;
pub mod peer;
pub mod wire;

pub use command::{CommandBuilder, CommandParts};
pub use connector::{ProcessConnector, ProcessError};
pub use peer::HelperPeer;
