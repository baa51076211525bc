//! In-memory session store.

use std::sync::RwLock;

use async_trait::async_trait;
use wabridge_core::{
    SessionState,
    traits::{Loaded, SessionStore, StoreError},
};

/// In-memory store.
///
/// Useful for tests and throwaway deployments.
/// Credentials are lost on restart, so every start issues a QR challenge.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    state: RwLock<SessionState>,
    saves: RwLock<usize>,
}

impl MemorySessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-seeded with credentials.
    #[must_use]
    pub fn with_state(state: SessionState) -> Self {
        Self {
            state: RwLock::new(state),
            saves: RwLock::new(0),
        }
    }

    /// Current stored state.
    #[must_use]
    pub fn snapshot(&self) -> SessionState {
        self.state.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// How many times `save` succeeded.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.read().map(|n| *n).unwrap_or(0)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> Loaded {
        match self.state.read() {
            Ok(state) => Loaded {
                state: state.clone(),
                warning: None,
            },
            Err(e) => Loaded {
                state: SessionState::empty(),
                warning: Some(StoreError::Io(std::io::Error::other(e.to_string()))),
            },
        }
    }

    async fn save(&self, state: &SessionState) -> Result<(), StoreError> {
        *self
            .state
            .write()
            .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))? = state.clone();
        *self
            .saves
            .write()
            .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))? += 1;
        Ok(())
    }
}
