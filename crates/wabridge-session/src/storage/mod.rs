//! Session store implementations.

pub mod file;

#[cfg(feature = "memory")]
pub mod memory;

pub use file::FileSessionStore;

#[cfg(feature = "memory")]
pub use memory::MemorySessionStore;
