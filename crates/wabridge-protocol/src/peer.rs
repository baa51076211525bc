//! Request/reply and notification plumbing over the helper's stdio.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{Mutex, mpsc, oneshot},
};
use wabridge_core::traits::{ExternalError, Notification};

use crate::{
    connector::ProcessError,
    wire::{BridgeRequest, Decoded, decode_line},
};

/// How long a send waits for the helper's reply.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(30);

const NOTIFICATION_CAPACITY: usize = 64;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Reply = oneshot::Sender<Result<(), String>>;

struct Inner {
    writer: Mutex<Writer>,
    pending: std::sync::Mutex<HashMap<u64, Reply>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    fn take_pending(&self, id: u64) -> Option<Reply> {
        self.pending.lock().ok().and_then(|mut map| map.remove(&id))
    }

    fn fail_pending(&self) {
        if let Ok(mut map) = self.pending.lock() {
            // Dropping the senders wakes every waiter with `Closed`.
            map.clear();
        }
    }
}

/// One end of the helper conversation.
///
/// Lines read from the helper are decoded into [`Notification`]s or matched
/// against outstanding sends by id. When the helper's output ends, pending
/// sends fail and the notification stream closes.
#[derive(Clone)]
pub struct HelperPeer {
    inner: Arc<Inner>,
    send_timeout: Duration,
}

impl HelperPeer {
    /// Start reading from `reader` in a background task.
    ///
    /// Returns the peer and the notification stream.
    pub fn spawn<R, W>(reader: R, writer: W) -> (Self, mpsc::Receiver<Notification>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let inner = Arc::new(Inner {
            writer: Mutex::new(Box::new(writer)),
            pending: std::sync::Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });
        let (tx, rx) = mpsc::channel(NOTIFICATION_CAPACITY);

        let reader_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            if let Err(e) = read_loop(&reader_inner, reader, tx).await {
                tracing::error!("Helper reader loop error: {}", e);
            }
            reader_inner.closed.store(true, Ordering::SeqCst);
            reader_inner.fail_pending();
        });

        (
            Self {
                inner,
                send_timeout: SEND_TIMEOUT,
            },
            rx,
        )
    }

    /// Override the reply timeout for sends.
    #[must_use]
    pub const fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Whether the helper's output has ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Write one request line.
    ///
    /// # Errors
    /// Returns error if serialization or the write fails.
    pub async fn request(&self, request: &BridgeRequest) -> Result<(), ProcessError> {
        let json = serde_json::to_string(request)?;
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send a text message and wait for the helper to confirm it.
    ///
    /// # Errors
    /// Returns `Closed` if the helper is gone, `Send` if it rejected the
    /// message or did not answer in time.
    pub async fn send_text(&self, to: &str, text: &str) -> Result<(), ExternalError> {
        if self.is_closed() {
            return Err(ExternalError::Closed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .map_err(|e| ExternalError::Protocol(e.to_string()))?
            .insert(id, reply_tx);

        // The reader may have drained pending replies before our insert.
        if self.is_closed() {
            self.inner.take_pending(id);
            return Err(ExternalError::Closed);
        }

        let request = BridgeRequest::Send {
            id,
            to: to.to_string(),
            text: text.to_string(),
        };
        if let Err(e) = self.request(&request).await {
            self.inner.take_pending(id);
            return Err(ExternalError::Send(e.to_string()));
        }

        match tokio::time::timeout(self.send_timeout, reply_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(ExternalError::Send(reason)),
            Ok(Err(_)) => Err(ExternalError::Closed),
            Err(_) => {
                self.inner.take_pending(id);
                Err(ExternalError::Send(format!(
                    "no reply within {}s",
                    self.send_timeout.as_secs()
                )))
            }
        }
    }

    /// Ask the helper to close the session.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.request(&BridgeRequest::Close).await {
            tracing::debug!("Failed to send close to helper: {e}");
        }
    }
}

async fn read_loop<R>(
    inner: &Inner,
    reader: R,
    tx: mpsc::Sender<Notification>,
) -> Result<(), ProcessError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buffer = String::new();

    loop {
        buffer.clear();
        if reader.read_line(&mut buffer).await? == 0 {
            tracing::debug!("Helper output ended");
            return Ok(());
        }

        let line = buffer.trim();
        if line.is_empty() {
            continue;
        }

        match decode_line(line) {
            Decoded::Notify(notification) => {
                if tx.send(notification).await.is_err() {
                    tracing::debug!("Notification receiver dropped; stopping reader");
                    return Ok(());
                }
            }
            Decoded::Reply { id, result } => match inner.take_pending(id) {
                Some(reply) => {
                    let _ = reply.send(result);
                }
                None => tracing::debug!(id, "reply for unknown send"),
            },
            Decoded::Ignore => {}
        }
    }
}
