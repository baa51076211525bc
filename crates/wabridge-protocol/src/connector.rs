//! `SessionConnector` backed by a helper subprocess.

use std::{process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use thiserror::Error;
use tokio::process::Command;
use wabridge_core::traits::{
    ConnectOptions, Connection, ExternalError, ProtocolVersion, SessionConnector, SessionHandle,
};

use crate::{
    command::{CommandBuildError, CommandBuilder},
    peer::HelperPeer,
    wire::BridgeRequest,
};

/// How long a closing helper gets to exit before its process group is killed.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Helper process error.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Command build error: {0}")]
    Command(#[from] CommandBuildError),
    #[error("Spawn failed: {0}")]
    Spawn(std::io::Error),
    #[error("Helper {0} was not piped")]
    MissingPipe(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ProcessError> for ExternalError {
    fn from(e: ProcessError) -> Self {
        Self::Connect(e.to_string())
    }
}

/// Opens sessions by spawning the helper command and speaking NDJSON on its
/// stdin/stdout. The helper's stderr is inherited.
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    command: CommandBuilder,
    version: Option<ProtocolVersion>,
}

impl ProcessConnector {
    /// Create a connector for the given helper command.
    #[must_use]
    pub const fn new(command: CommandBuilder) -> Self {
        Self {
            command,
            version: None,
        }
    }

    /// Create a connector from a shell-style command line.
    #[must_use]
    pub fn from_command_line(line: impl Into<String>) -> Self {
        Self::new(CommandBuilder::new(line))
    }

    /// Pin the protocol version passed to the helper.
    #[must_use]
    pub const fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = Some(version);
        self
    }

    async fn spawn(&self, options: ConnectOptions) -> Result<Connection, ProcessError> {
        let (program, args) = self.command.build()?.into_resolved().await?;
        tracing::debug!(program = %program.display(), ?args, "spawning helper");

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.group_spawn().map_err(ProcessError::Spawn)?;
        let stdin = child
            .inner()
            .stdin
            .take()
            .ok_or(ProcessError::MissingPipe("stdin"))?;
        let stdout = child
            .inner()
            .stdout
            .take()
            .ok_or(ProcessError::MissingPipe("stdout"))?;

        let (peer, notifications) = HelperPeer::spawn(stdout, stdin);
        let handle = HelperHandle {
            peer,
            child: std::sync::Mutex::new(Some(child)),
        };
        handle
            .peer
            .request(&BridgeRequest::start(&options.state, options.version))
            .await?;

        Ok(Connection {
            handle: Arc::new(handle),
            notifications,
        })
    }
}

#[async_trait]
impl SessionConnector for ProcessConnector {
    async fn negotiate_version(&self) -> Result<Option<ProtocolVersion>, ExternalError> {
        Ok(self.version)
    }

    async fn connect(&self, options: ConnectOptions) -> Result<Connection, ExternalError> {
        Ok(self.spawn(options).await?)
    }
}

/// Handle to one running helper.
struct HelperHandle {
    peer: HelperPeer,
    child: std::sync::Mutex<Option<AsyncGroupChild>>,
}

impl HelperHandle {
    fn take_child(&self) -> Option<AsyncGroupChild> {
        self.child.lock().ok().and_then(|mut child| child.take())
    }
}

#[async_trait]
impl SessionHandle for HelperHandle {
    async fn send_text(&self, to: &str, text: &str) -> Result<(), ExternalError> {
        self.peer.send_text(to, text).await
    }

    async fn close(&self) {
        self.peer.close().await;

        let Some(mut child) = self.take_child() else {
            return;
        };
        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(%status, "helper exited"),
            Ok(Err(e)) => tracing::warn!("Failed to wait for helper: {e}"),
            Err(_) => {
                tracing::debug!("helper did not exit in time; killing process group");
                if let Err(e) = child.start_kill() {
                    tracing::warn!("Failed to kill helper: {e}");
                }
                let _ = child.wait().await;
            }
        }
    }
}

impl Drop for HelperHandle {
    fn drop(&mut self) {
        if let Some(mut child) = self.take_child() {
            let _ = child.start_kill();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use wabridge_core::{SessionState, traits::Notification};

    use super::*;

    // Shell stand-in for the helper: echoes a QR, then confirms send id 1.
    const SCRIPT: &str = r#"sh -c 'read start; echo "{\"type\":\"qr\",\"qr\":\"from-helper\"}"; read send; echo "{\"type\":\"sent\",\"id\":1}"; read close'"#;

    #[tokio::test]
    async fn test_spawned_helper_roundtrip() {
        let connector = ProcessConnector::from_command_line(SCRIPT);
        let mut connection = connector
            .connect(ConnectOptions {
                state: SessionState::empty(),
                version: None,
            })
            .await
            .unwrap();

        assert!(matches!(
            connection.notifications.recv().await,
            Some(Notification::Qr(q)) if q == "from-helper"
        ));
        connection.handle.send_text("123", "hi").await.unwrap();

        connection.handle.close().await;
        assert!(connection.notifications.recv().await.is_none());
        connection.handle.close().await;
    }

    #[tokio::test]
    async fn test_missing_helper_is_connect_error() {
        let connector = ProcessConnector::from_command_line("no-such-wabridge-helper --flag");
        let err = connector
            .connect(ConnectOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ExternalError::Connect(_)));
    }

    #[tokio::test]
    async fn test_pinned_version_is_negotiated() {
        let connector =
            ProcessConnector::from_command_line("node helper.js").with_version(ProtocolVersion([2, 3000, 1]));
        assert_eq!(
            connector.negotiate_version().await.unwrap(),
            Some(ProtocolVersion([2, 3000, 1]))
        );
    }
}
