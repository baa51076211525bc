//! Credential storage and connection management for the bridge.
//!
//! Provides:
//! - `ConnectionManager` - Own the external session and its lifecycle
//! - Storage implementations (file, memory)

pub mod manager;
pub mod storage;

pub use manager::{ConnectionManager, ManagerOptions};
