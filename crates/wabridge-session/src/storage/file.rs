//! File-backed session store.
//!
//! The blob lives at `<dir>/session.blob`. Saves go through
//! `<dir>/session.blob.tmp`, are fsynced, then renamed over the blob, so a
//! crash mid-write leaves either the old or the new blob intact.

use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock, PoisonError},
};

use async_trait::async_trait;
use tokio::{fs, io::AsyncWriteExt};
use wabridge_core::{
    SessionState,
    traits::{Loaded, SessionStore, StoreError},
};

const BLOB_FILE: &str = "session.blob";
const TEMP_FILE: &str = "session.blob.tmp";

/// Directories currently claimed by a live store in this process.
fn claimed() -> &'static Mutex<HashSet<PathBuf>> {
    static CLAIMED: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    CLAIMED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Session store persisting one blob per directory.
///
/// Holds an exclusive claim on its directory until dropped.
#[derive(Debug)]
pub struct FileSessionStore {
    dir: PathBuf,
    claim: PathBuf,
}

impl FileSessionStore {
    /// Open a store rooted at `dir`. The directory is created on first save.
    ///
    /// # Errors
    /// Returns `PathInUse` if another live store already owns `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        let claim = std::path::absolute(&dir)?;
        let inserted = claimed()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(claim.clone());
        if !inserted {
            return Err(StoreError::PathInUse(dir.display().to_string()));
        }
        Ok(Self { dir, claim })
    }
}

impl Drop for FileSessionStore {
    fn drop(&mut self) {
        claimed()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.claim);
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> Loaded {
        load(&self.dir).await
    }

    async fn save(&self, state: &SessionState) -> Result<(), StoreError> {
        save(&self.dir, state).await
    }
}

/// Load the blob stored under `dir`.
///
/// A missing blob yields empty state. An unreadable one yields empty state
/// plus a warning.
pub async fn load(dir: &Path) -> Loaded {
    let path = dir.join(BLOB_FILE);
    match fs::read(&path).await {
        Ok(bytes) => {
            tracing::debug!(path = %path.display(), len = bytes.len(), "loaded session state");
            Loaded {
                state: SessionState::from_bytes(bytes),
                warning: None,
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no stored session, starting unauthenticated");
            Loaded::default()
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "session state unreadable, starting empty");
            Loaded {
                state: SessionState::empty(),
                warning: Some(StoreError::Io(e)),
            }
        }
    }
}

/// Atomically replace the blob stored under `dir`.
///
/// # Errors
/// Returns error if the directory cannot be created or the write fails.
pub async fn save(dir: &Path, state: &SessionState) -> Result<(), StoreError> {
    fs::create_dir_all(dir).await?;
    let temp = dir.join(TEMP_FILE);
    let target = dir.join(BLOB_FILE);

    if let Err(e) = write_synced(&temp, state.as_bytes()).await {
        let _ = fs::remove_file(&temp).await;
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&temp, &target).await {
        let _ = fs::remove_file(&temp).await;
        return Err(e.into());
    }
    sync_dir(dir).await;

    tracing::trace!(path = %target.display(), len = state.as_bytes().len(), "saved session state");
    Ok(())
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

// Persist the rename itself. Directories cannot be opened for sync on Windows.
#[cfg(unix)]
async fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir).await {
        let _ = handle.sync_all().await;
    }
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_blob_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let loaded = load(&tmp.path().join("never-created")).await;
        assert!(loaded.state.is_empty());
        assert!(loaded.warning.is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("auth");
        let store = FileSessionStore::open(&dir).unwrap();

        tokio_test::assert_ok!(store.save(&SessionState::from_bytes(b"creds-v1".to_vec())).await);
        tokio_test::assert_ok!(store.save(&SessionState::from_bytes(b"creds-v2".to_vec())).await);

        let loaded = store.load().await;
        assert_eq!(loaded.state.as_bytes(), b"creds-v2");
        assert!(loaded.warning.is_none());
        assert!(!dir.join(TEMP_FILE).exists());
    }

    #[tokio::test]
    async fn test_leftover_temp_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        save(tmp.path(), &SessionState::from_bytes(b"good".to_vec()))
            .await
            .unwrap();
        std::fs::write(tmp.path().join(TEMP_FILE), b"half-writ").unwrap();

        let loaded = load(tmp.path()).await;
        assert_eq!(loaded.state.as_bytes(), b"good");
    }

    #[tokio::test]
    async fn test_unreadable_blob_warns() {
        let tmp = tempfile::tempdir().unwrap();
        // A directory where the blob should be cannot be read as a file.
        std::fs::create_dir(tmp.path().join(BLOB_FILE)).unwrap();

        let loaded = load(tmp.path()).await;
        assert!(loaded.state.is_empty());
        assert!(matches!(loaded.warning, Some(StoreError::Io(_))));
    }

    #[test]
    fn test_directory_claim_is_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let first = FileSessionStore::open(tmp.path()).unwrap();
        assert!(matches!(
            FileSessionStore::open(tmp.path()),
            Err(StoreError::PathInUse(_))
        ));
        drop(first);
        assert!(FileSessionStore::open(tmp.path()).is_ok());
    }
}
