//! WebSocket relay server.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    net::TcpListener,
    sync::{Mutex, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use wabridge_core::{
    Bridge, BridgeEvent, OutboundCommand, event_bus::into_stream, traits::BridgeError,
};

use crate::{
    consumer::{ChannelConsumer, ConsumerId, ConsumerRegistry},
    protocol::{ClientMessage, ServerMessage},
};

/// Default per-consumer outbound queue, in frames.
pub const DEFAULT_CONSUMER_BUFFER: usize = 256;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Relay server error.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),
    #[error("Relay already running")]
    AlreadyRunning,
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

#[derive(Clone)]
struct RelayState {
    bridge: Arc<dyn Bridge>,
    registry: Arc<ConsumerRegistry>,
    consumer_buffer: usize,
}

struct Running {
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    serve: JoinHandle<()>,
    fanout: JoinHandle<()>,
}

/// Accepts consumers, fans bridge events out to them and forwards their
/// commands to the bridge.
pub struct RelayServer {
    state: RelayState,
    running: Mutex<Option<Running>>,
}

impl RelayServer {
    /// Create a relay in front of `bridge`.
    #[must_use]
    pub fn new(bridge: Arc<dyn Bridge>) -> Self {
        Self {
            state: RelayState {
                bridge,
                registry: Arc::new(ConsumerRegistry::new()),
                consumer_buffer: DEFAULT_CONSUMER_BUFFER,
            },
            running: Mutex::new(None),
        }
    }

    /// Set the per-consumer outbound queue size.
    #[must_use]
    pub fn with_consumer_buffer(mut self, frames: usize) -> Self {
        self.state.consumer_buffer = frames.max(1);
        self
    }

    /// Consumer registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConsumerRegistry> {
        &self.state.registry
    }

    /// Address the relay is listening on, while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Bind `addr`, start serving consumers and start the bridge.
    ///
    /// Returns the bound address.
    ///
    /// # Errors
    /// Returns error if already running, if binding fails, or if the bridge
    /// refuses to start.
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr, RelayError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(RelayError::AlreadyRunning);
        }

        let listener = TcpListener::bind(addr).await.map_err(RelayError::Bind)?;
        let local_addr = listener.local_addr().map_err(RelayError::Bind)?;

        // Subscribe before the bridge starts so its first events reach consumers.
        let fanout = tokio::spawn(fan_out(
            into_stream(self.state.bridge.subscribe()),
            Arc::clone(&self.state.registry),
        ));

        let app = Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self.state.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let serve = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                tracing::error!("Relay server error: {e}");
            }
        });

        if let Err(e) = self.state.bridge.start().await {
            let _ = shutdown_tx.send(());
            serve.abort();
            fanout.abort();
            return Err(e.into());
        }

        tracing::info!(%local_addr, "relay listening");
        *running = Some(Running {
            local_addr,
            shutdown_tx,
            serve,
            fanout,
        });
        Ok(local_addr)
    }

    /// Close every consumer, stop accepting, then stop the bridge.
    /// Idempotent.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();

        self.state.registry.close_all().await;

        if let Some(Running {
            shutdown_tx,
            mut serve,
            fanout,
            ..
        }) = running
        {
            let _ = shutdown_tx.send(());
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut serve).await.is_err() {
                tracing::warn!("relay did not shut down in time; aborting");
                serve.abort();
            }
            fanout.abort();
            tracing::info!("relay stopped");
        }

        self.state.bridge.stop().await;
    }
}

async fn fan_out(
    mut events: futures::stream::BoxStream<'static, BridgeEvent>,
    registry: Arc<ConsumerRegistry>,
) {
    while let Some(event) = events.next().await {
        if matches!(event, BridgeEvent::Ack { .. }) {
            continue;
        }
        registry.broadcast(&ServerMessage::from(event)).await;
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();

    let id = state.registry.next_id();
    let (consumer, mut frames, mut closed) = ChannelConsumer::new(id, state.consumer_buffer);
    let consumer = Arc::new(consumer);
    if !state.registry.register(consumer.clone()).await {
        let _ = sender.send(Message::Close(None)).await;
        return;
    }
    tracing::info!(consumer_id = id, "consumer connected");

    let mut send_task = tokio::spawn(write_frames(sender, frames, closed.clone()));

    loop {
        let msg = tokio::select! {
            msg = receiver.next() => msg,
            () = async { let _ = closed.wait_for(|closed| *closed).await; } => break,
        };
        let text = match msg {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    if !state
                        .registry
                        .reply(consumer.as_ref(), &ServerMessage::error("binary frame is not UTF-8"))
                        .await
                    {
                        break;
                    }
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::warn!(consumer_id = id, "WebSocket error: {e}");
                break;
            }
        };

        let reply = match ClientMessage::parse(&text) {
            Ok(message) => {
                let command = OutboundCommand::from(message);
                let to = command.to.clone();
                match state.bridge.send(command).await {
                    Ok(()) => ServerMessage::Sent { to },
                    Err(e) => {
                        tracing::debug!(consumer_id = id, %to, error = %e, "send failed");
                        ServerMessage::error(e)
                    }
                }
            }
            Err(e) => {
                tracing::warn!(consumer_id = id, "Invalid client message: {e}");
                ServerMessage::error(format!("Invalid message: {e}"))
            }
        };
        if !state.registry.reply(consumer.as_ref(), &reply).await {
            break;
        }
    }

    state.registry.remove(id).await;
    join_writer(&mut send_task, SHUTDOWN_GRACE, id).await;
    tracing::info!(consumer_id = id, "consumer disconnected");
}

/// Drain `frames` into `sink` until the consumer is closed, then send a
/// close frame.
async fn write_frames<S>(
    mut sink: S,
    mut frames: mpsc::Receiver<Arc<str>>,
    mut closed: watch::Receiver<bool>,
) where
    S: Sink<Message> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
                    break;
                }
            }
            () = async { let _ = closed.wait_for(|closed| *closed).await; } => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

/// Wait up to `grace` for the writer, aborting it if the peer has stopped
/// reading. Returns whether it finished on its own.
async fn join_writer(task: &mut JoinHandle<()>, grace: Duration, id: ConsumerId) -> bool {
    if tokio::time::timeout(grace, &mut *task).await.is_ok() {
        return true;
    }
    tracing::debug!(consumer_id = id, "writer stalled; aborting");
    task.abort();
    false
}
