//! Connection manager owning the single external session.
//!
//! All notifications from the external session are handled by one intake
//! task, so state transitions never run concurrently. `stop()` is the only
//! other writer, and it goes through the same lock; `Stopped` is absorbing.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use wabridge_core::{
    BridgeConfig, BridgeEvent, CloseAction, CloseReason, ConnectionState, EventBus, LinkStatus,
    OutboundCommand, SessionState,
    normalize::extract_batch,
    traits::{
        Bridge, BridgeError, ConnectOptions, Connection, Notification, SendError, SessionConnector,
        SessionHandle, SessionStore,
    },
};

/// Connection manager tuning.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Fixed delay before each reconnect attempt.
    pub reconnect_delay: Duration,
    /// How long `stop()` waits for the intake task before aborting it.
    pub stop_grace: Duration,
    /// Event bus capacity per subscriber.
    pub event_capacity: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            stop_grace: Duration::from_secs(2),
            event_capacity: 1024,
        }
    }
}

impl From<&BridgeConfig> for ManagerOptions {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            reconnect_delay: config.reconnect_delay(),
            ..Self::default()
        }
    }
}

struct Inner {
    state: ConnectionState,
    handle: Option<Arc<dyn SessionHandle>>,
    started: bool,
}

struct Shared<C, S> {
    connector: C,
    store: S,
    options: ManagerOptions,
    bus: EventBus,
    inner: Mutex<Inner>,
}

struct Running {
    cancel_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// How a session's intake loop ended.
enum Exit {
    Cancelled,
    Reconnect,
    Terminated,
}

/// Owns the external session, its state machine and reconnection policy.
pub struct ConnectionManager<C, S>
where
    C: SessionConnector + 'static,
    S: SessionStore + 'static,
{
    shared: Arc<Shared<C, S>>,
    running: Mutex<Option<Running>>,
}

impl<C, S> ConnectionManager<C, S>
where
    C: SessionConnector + 'static,
    S: SessionStore + 'static,
{
    /// Create a new connection manager.
    #[must_use]
    pub fn new(connector: C, store: S, options: ManagerOptions) -> Self {
        let bus = EventBus::with_capacity(options.event_capacity);
        Self {
            shared: Arc::new(Shared {
                connector,
                store,
                options,
                bus,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    handle: None,
                    started: false,
                }),
            }),
            running: Mutex::new(None),
        }
    }

    /// Start the intake task.
    ///
    /// # Errors
    /// Returns error if already started or stopped.
    pub fn start(&self) -> Result<(), BridgeError> {
        let mut running = lock(&self.running);
        {
            let mut inner = lock(&self.shared.inner);
            if inner.state.is_stopped() {
                return Err(BridgeError::Stopped);
            }
            if inner.started {
                return Err(BridgeError::AlreadyStarted);
            }
            inner.started = true;
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let join = tokio::spawn(run(Arc::clone(&self.shared), cancel_rx));
        *running = Some(Running { cancel_tx, join });
        tracing::info!("connection manager started");
        Ok(())
    }

    /// Send a text message through the external session.
    ///
    /// Fails immediately with `NotConnected` unless the state is `Connected`.
    /// Never queued, never retried.
    ///
    /// # Errors
    /// Returns error if not connected or the external send fails.
    pub async fn send(&self, command: OutboundCommand) -> Result<(), SendError> {
        let handle = {
            let inner = lock(&self.shared.inner);
            if inner.state.is_connected() {
                inner.handle.clone()
            } else {
                None
            }
        }
        .ok_or(SendError::NotConnected)?;

        handle.send_text(&command.to, &command.text).await?;
        tracing::debug!(to = %command.to, "message sent");
        Ok(())
    }

    /// Stop the manager. Idempotent.
    pub async fn stop(&self) {
        let running = lock(&self.running).take();
        let (previous, handle) = {
            let mut inner = lock(&self.shared.inner);
            let previous = inner.state;
            inner.state = ConnectionState::Stopped;
            (previous, inner.handle.take())
        };
        if previous != ConnectionState::Stopped {
            tracing::info!(from = %previous, "connection manager stopped");
        }

        if let Some(handle) = handle {
            handle.close().await;
        }
        if let Some(Running { cancel_tx, mut join }) = running {
            let _ = cancel_tx.send(());
            if tokio::time::timeout(self.shared.options.stop_grace, &mut join)
                .await
                .is_err()
            {
                tracing::warn!("intake task did not finish in time, aborting");
                join.abort();
            }
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.inner).state
    }

    /// Subscribe to future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.shared.bus.subscribe()
    }
}

#[async_trait]
impl<C, S> Bridge for ConnectionManager<C, S>
where
    C: SessionConnector + 'static,
    S: SessionStore + 'static,
{
    async fn start(&self) -> Result<(), BridgeError> {
        Self::start(self)
    }

    async fn send(&self, command: OutboundCommand) -> Result<(), SendError> {
        Self::send(self, command).await
    }

    fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        Self::subscribe(self)
    }

    fn state(&self) -> ConnectionState {
        Self::state(self)
    }

    async fn stop(&self) {
        Self::stop(self).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C, S> Shared<C, S> {
    /// Apply a transition if legal. Returns whether it was applied.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut inner = lock(&self.inner);
        let current = inner.state;
        if !current.can_transition_to(next) {
            tracing::debug!(from = %current, to = %next, "transition refused");
            return false;
        }
        inner.state = next;
        if current != next {
            tracing::info!(from = %current, to = %next, "connection state changed");
        }
        true
    }

    /// React to a close notification. The check and the state change happen
    /// under one lock, so a second close cannot schedule a second reconnect.
    fn on_close(&self, reason: &CloseReason) -> CloseAction {
        let action = {
            let mut inner = lock(&self.inner);
            let action = inner.state.close_action(reason);
            let next = match action {
                CloseAction::Reconnect => ConnectionState::Reconnecting,
                CloseAction::Terminate => ConnectionState::Stopped,
                CloseAction::Ignore => return action,
            };
            tracing::info!(from = %inner.state, to = %next, ?reason, "session closed");
            inner.state = next;
            inner.handle = None;
            action
        };
        self.bus.publish(BridgeEvent::Status(LinkStatus::Disconnected));
        action
    }

    /// Install the handle of a freshly opened session unless stopped.
    fn install_handle(&self, handle: Arc<dyn SessionHandle>) -> bool {
        let mut inner = lock(&self.inner);
        if inner.state.is_stopped() {
            return false;
        }
        inner.handle = Some(handle);
        true
    }

    fn clear_handle(&self) {
        lock(&self.inner).handle = None;
    }

    fn is_stopped(&self) -> bool {
        lock(&self.inner).state.is_stopped()
    }
}

async fn run<C, S>(shared: Arc<Shared<C, S>>, mut cancel: oneshot::Receiver<()>)
where
    C: SessionConnector,
    S: SessionStore,
{
    let loaded = shared.store.load().await;
    if let Some(warning) = loaded.warning {
        shared
            .bus
            .publish(BridgeEvent::Error(format!("session store unreadable: {warning}")));
    }
    let mut creds = loaded.state;

    let version = match shared.connector.negotiate_version().await {
        Ok(version) => version,
        Err(e) => {
            tracing::warn!(error = %e, "version negotiation failed, using session default");
            None
        }
    };
    if let Some(version) = version {
        tracing::info!(%version, "negotiated protocol version");
    }

    loop {
        if !shared.transition(ConnectionState::Connecting) {
            return;
        }

        let options = ConnectOptions {
            state: creds.clone(),
            version,
        };
        let opened = tokio::select! {
            _ = &mut cancel => return,
            opened = shared.connector.connect(options) => opened,
        };

        match opened {
            Ok(Connection {
                handle,
                mut notifications,
            }) => {
                if !shared.install_handle(Arc::clone(&handle)) {
                    handle.close().await;
                    return;
                }
                let exit = intake(&shared, &mut notifications, &mut creds, &mut cancel).await;
                shared.clear_handle();
                handle.close().await;
                match exit {
                    Exit::Cancelled | Exit::Terminated => return,
                    Exit::Reconnect => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to open session");
                shared
                    .bus
                    .publish(BridgeEvent::Error(format!("connect failed: {e}")));
                if !shared.transition(ConnectionState::Reconnecting) {
                    return;
                }
            }
        }

        tracing::info!(delay = ?shared.options.reconnect_delay, "reconnect scheduled");
        tokio::select! {
            _ = &mut cancel => return,
            () = tokio::time::sleep(shared.options.reconnect_delay) => {}
        }
    }
}

/// Serialized intake of one session's notifications.
async fn intake<C, S>(
    shared: &Shared<C, S>,
    notifications: &mut mpsc::Receiver<Notification>,
    creds: &mut SessionState,
    cancel: &mut oneshot::Receiver<()>,
) -> Exit
where
    S: SessionStore,
{
    let mut own_id: Option<String> = None;

    loop {
        let notification = tokio::select! {
            biased;
            _ = &mut *cancel => return Exit::Cancelled,
            notification = notifications.recv() => notification,
        };

        let Some(notification) = notification else {
            let reason = CloseReason::Other("notification stream ended".to_string());
            match shared.on_close(&reason) {
                CloseAction::Reconnect => return Exit::Reconnect,
                CloseAction::Terminate | CloseAction::Ignore => return Exit::Terminated,
            }
        };

        match notification {
            Notification::Qr(code) => {
                if shared.transition(ConnectionState::QrPending) {
                    shared.bus.publish(BridgeEvent::Qr(code));
                }
            }
            Notification::Open { own_id: me } => {
                own_id = me;
                if shared.transition(ConnectionState::Connected) {
                    shared
                        .bus
                        .publish(BridgeEvent::Status(LinkStatus::Connected));
                }
            }
            Notification::CredsUpdated(state) => {
                if let Err(e) = shared.store.save(&state).await {
                    tracing::error!(error = %e, "failed to persist session state");
                    shared
                        .bus
                        .publish(BridgeEvent::Error(format!("failed to persist session: {e}")));
                }
                *creds = state;
            }
            Notification::Messages { kind, events } => {
                if shared.is_stopped() {
                    continue;
                }
                for message in extract_batch(kind, &events, own_id.as_deref()) {
                    tracing::debug!(id = %message.id, sender = %message.sender, "inbound message");
                    shared.bus.publish(BridgeEvent::Message(message));
                }
            }
            Notification::Close(reason) => match shared.on_close(&reason) {
                CloseAction::Reconnect => return Exit::Reconnect,
                CloseAction::Terminate => return Exit::Terminated,
                CloseAction::Ignore => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use serde_json::json;
    use tokio::time::timeout;
    use wabridge_core::{
        raw::{RawEvent, UpsertKind},
        traits::ExternalError,
    };

    use super::*;
    use crate::storage::MemorySessionStore;

    const WAIT: Duration = Duration::from_secs(2);

    struct FakeSession {
        notify: mpsc::Sender<Notification>,
        sent: Arc<Mutex<Vec<(String, String)>>>,
        closed: Arc<AtomicBool>,
        options: ConnectOptions,
    }

    struct FakeHandle {
        sent: Arc<Mutex<Vec<(String, String)>>>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl SessionHandle for FakeHandle {
        async fn send_text(&self, to: &str, text: &str) -> Result<(), ExternalError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ExternalError::Closed);
            }
            lock(&self.sent).push((to.to_string(), text.to_string()));
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct FakeConnector {
        opened: mpsc::UnboundedSender<FakeSession>,
        connects: Arc<AtomicUsize>,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl SessionConnector for FakeConnector {
        async fn connect(&self, options: ConnectOptions) -> Result<Connection, ExternalError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ExternalError::Connect("network unreachable".into()));
            }
            let (notify, notifications) = mpsc::channel(64);
            let sent = Arc::new(Mutex::new(Vec::new()));
            let closed = Arc::new(AtomicBool::new(false));
            let handle = Arc::new(FakeHandle {
                sent: Arc::clone(&sent),
                closed: Arc::clone(&closed),
            });
            let _ = self.opened.send(FakeSession {
                notify,
                sent,
                closed,
                options,
            });
            Ok(Connection {
                handle,
                notifications,
            })
        }
    }

    struct Harness {
        manager: ConnectionManager<FakeConnector, Arc<MemorySessionStore>>,
        store: Arc<MemorySessionStore>,
        opened: mpsc::UnboundedReceiver<FakeSession>,
        connects: Arc<AtomicUsize>,
        events: broadcast::Receiver<BridgeEvent>,
    }

    fn harness_with(delay: Duration, failures: usize, store: MemorySessionStore) -> Harness {
        let (opened_tx, opened) = mpsc::unbounded_channel();
        let connects = Arc::new(AtomicUsize::new(0));
        let connector = FakeConnector {
            opened: opened_tx,
            connects: Arc::clone(&connects),
            failures: AtomicUsize::new(failures),
        };
        let store = Arc::new(store);
        let manager = ConnectionManager::new(
            connector,
            Arc::clone(&store),
            ManagerOptions {
                reconnect_delay: delay,
                ..ManagerOptions::default()
            },
        );
        let events = manager.subscribe();
        Harness {
            manager,
            store,
            opened,
            connects,
            events,
        }
    }

    fn harness(delay: Duration) -> Harness {
        harness_with(delay, 0, MemorySessionStore::new())
    }

    async fn next_session(h: &mut Harness) -> FakeSession {
        timeout(WAIT, h.opened.recv()).await.unwrap().unwrap()
    }

    async fn next_event(h: &mut Harness) -> BridgeEvent {
        timeout(WAIT, h.events.recv()).await.unwrap().unwrap()
    }

    async fn open(h: &mut Harness) -> FakeSession {
        h.manager.start().unwrap();
        let session = next_session(h).await;
        session
            .notify
            .send(Notification::Open {
                own_id: Some("15550000000:3@s.whatsapp.net".into()),
            })
            .await
            .unwrap();
        assert_eq!(
            next_event(h).await,
            BridgeEvent::Status(LinkStatus::Connected)
        );
        session
    }

    #[tokio::test]
    async fn test_qr_then_connected() {
        let mut h = harness(Duration::from_millis(10));
        h.manager.start().unwrap();
        let session = next_session(&mut h).await;
        assert!(session.options.state.is_empty());

        session
            .notify
            .send(Notification::Qr("2@abc,def".into()))
            .await
            .unwrap();
        assert_eq!(next_event(&mut h).await, BridgeEvent::Qr("2@abc,def".into()));
        assert_eq!(h.manager.state(), ConnectionState::QrPending);

        session
            .notify
            .send(Notification::Open { own_id: None })
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut h).await,
            BridgeEvent::Status(LinkStatus::Connected)
        );
        assert_eq!(h.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_send_requires_connected() {
        let mut h = harness(Duration::from_millis(10));
        let err = h.manager.send(OutboundCommand::send("123", "hi")).await;
        assert!(matches!(err, Err(SendError::NotConnected)));

        h.manager.start().unwrap();
        let session = next_session(&mut h).await;
        session
            .notify
            .send(Notification::Qr("code".into()))
            .await
            .unwrap();
        next_event(&mut h).await;
        let err = h.manager.send(OutboundCommand::send("123", "hi")).await;
        assert!(matches!(err, Err(SendError::NotConnected)));
        assert!(lock(&session.sent).is_empty());

        session
            .notify
            .send(Notification::Open { own_id: None })
            .await
            .unwrap();
        next_event(&mut h).await;
        tokio_test::assert_ok!(h.manager.send(OutboundCommand::send("123", "hi")).await);
        assert_eq!(
            *lock(&session.sent),
            vec![("123".to_string(), "hi".to_string())]
        );
    }

    #[tokio::test]
    async fn test_creds_update_is_persisted_and_reused() {
        let mut h = harness(Duration::from_millis(10));
        let session = open(&mut h).await;

        session
            .notify
            .send(Notification::CredsUpdated(SessionState::from_bytes(
                b"rotated".to_vec(),
            )))
            .await
            .unwrap();
        session
            .notify
            .send(Notification::Close(CloseReason::Other("restart required".into())))
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut h).await,
            BridgeEvent::Status(LinkStatus::Disconnected)
        );
        assert_eq!(h.store.snapshot().as_bytes(), b"rotated");
        assert_eq!(h.store.save_count(), 1);

        let second = next_session(&mut h).await;
        assert_eq!(second.options.state.as_bytes(), b"rotated");
    }

    #[tokio::test]
    async fn test_messages_are_normalized() {
        let mut h = harness(Duration::from_millis(10));
        let session = open(&mut h).await;

        let events: Vec<RawEvent> = serde_json::from_value(json!([
            {
                "key": {"remoteJid": "123@s.whatsapp.net", "id": "A"},
                "message": {"imageMessage": {"caption": "look"}},
                "messageTimestamp": 10
            },
            {
                "key": {"remoteJid": "123@s.whatsapp.net", "id": "B", "fromMe": true},
                "message": {"conversation": "mine"}
            },
            {
                "key": {"remoteJid": "123@s.whatsapp.net", "id": "C"},
                "message": {"audioMessage": {}},
                "messageTimestamp": 11
            }
        ]))
        .unwrap();
        session
            .notify
            .send(Notification::Messages {
                kind: UpsertKind::Notify,
                events,
            })
            .await
            .unwrap();

        let BridgeEvent::Message(first) = next_event(&mut h).await else {
            panic!("expected message");
        };
        assert_eq!(first.content, "[Image] look");
        let BridgeEvent::Message(second) = next_event(&mut h).await else {
            panic!("expected message");
        };
        assert_eq!(second.id, "C");
        assert_eq!(second.content, "[Voice Message]");
    }

    #[tokio::test]
    async fn test_transient_close_reconnects_once() {
        let mut h = harness(Duration::from_millis(100));
        let session = open(&mut h).await;

        let reason = CloseReason::Other("connection lost".into());
        session
            .notify
            .send(Notification::Close(reason.clone()))
            .await
            .unwrap();
        let _ = session.notify.send(Notification::Close(reason)).await;

        assert_eq!(
            next_event(&mut h).await,
            BridgeEvent::Status(LinkStatus::Disconnected)
        );
        assert_eq!(h.manager.state(), ConnectionState::Reconnecting);

        let second = next_session(&mut h).await;
        assert!(session.closed.load(Ordering::SeqCst));
        second
            .notify
            .send(Notification::Open { own_id: None })
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut h).await,
            BridgeEvent::Status(LinkStatus::Connected)
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.connects.load(Ordering::SeqCst), 2);
        assert!(h.opened.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stream_end_is_transient() {
        let mut h = harness(Duration::from_millis(10));
        let session = open(&mut h).await;
        drop(session);

        assert_eq!(
            next_event(&mut h).await,
            BridgeEvent::Status(LinkStatus::Disconnected)
        );
        let _second = next_session(&mut h).await;
        assert_eq!(h.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_logout_is_terminal() {
        let mut h = harness(Duration::from_millis(10));
        let session = open(&mut h).await;

        session
            .notify
            .send(Notification::Close(CloseReason::LoggedOut))
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut h).await,
            BridgeEvent::Status(LinkStatus::Disconnected)
        );
        assert_eq!(h.manager.state(), ConnectionState::Stopped);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.connects.load(Ordering::SeqCst), 1);
        assert!(session.closed.load(Ordering::SeqCst));
        assert!(matches!(
            h.manager.send(OutboundCommand::send("1", "x")).await,
            Err(SendError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut h = harness(Duration::from_millis(10));
        let session = open(&mut h).await;

        h.manager.stop().await;
        assert_eq!(h.manager.state(), ConnectionState::Stopped);
        assert!(session.closed.load(Ordering::SeqCst));

        h.manager.stop().await;
        assert_eq!(h.manager.state(), ConnectionState::Stopped);
        assert!(matches!(h.manager.start(), Err(BridgeError::Stopped)));
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_reconnect() {
        let mut h = harness(Duration::from_secs(3600));
        let session = open(&mut h).await;
        session
            .notify
            .send(Notification::Close(CloseReason::Other("lost".into())))
            .await
            .unwrap();
        next_event(&mut h).await;
        assert_eq!(h.manager.state(), ConnectionState::Reconnecting);

        timeout(Duration::from_secs(1), h.manager.stop())
            .await
            .unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Stopped);
        assert_eq!(h.connects.load(Ordering::SeqCst), 1);
    }

    struct HangingConnector {
        connects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SessionConnector for HangingConnector {
        async fn connect(&self, _options: ConnectOptions) -> Result<Connection, ExternalError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stop_while_connecting() {
        let connects = Arc::new(AtomicUsize::new(0));
        let options = ManagerOptions {
            reconnect_delay: Duration::from_millis(10),
            ..ManagerOptions::default()
        };
        let grace = options.stop_grace;
        let manager = ConnectionManager::new(
            HangingConnector {
                connects: Arc::clone(&connects),
            },
            MemorySessionStore::new(),
            options,
        );
        manager.start().unwrap();
        timeout(WAIT, async {
            while connects.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(manager.state(), ConnectionState::Connecting);

        let started = std::time::Instant::now();
        manager.stop().await;
        assert!(started.elapsed() < grace);
        assert_eq!(manager.state(), ConnectionState::Stopped);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_while_qr_pending() {
        let mut h = harness(Duration::from_millis(10));
        h.manager.start().unwrap();
        let session = next_session(&mut h).await;
        session
            .notify
            .send(Notification::Qr("2@challenge".into()))
            .await
            .unwrap();
        timeout(WAIT, async {
            while h.manager.state() != ConnectionState::QrPending {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let started = std::time::Instant::now();
        h.manager.stop().await;
        assert!(started.elapsed() < ManagerOptions::default().stop_grace);
        assert_eq!(h.manager.state(), ConnectionState::Stopped);
        assert!(session.closed.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.connects.load(Ordering::SeqCst), 1);
        assert!(h.opened.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_retries() {
        let mut h = harness_with(Duration::from_millis(10), 1, MemorySessionStore::new());
        h.manager.start().unwrap();

        let BridgeEvent::Error(message) = next_event(&mut h).await else {
            panic!("expected error event");
        };
        assert!(message.contains("network unreachable"));

        let _session = next_session(&mut h).await;
        assert_eq!(h.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_start_twice() {
        let h = harness(Duration::from_millis(10));
        h.manager.start().unwrap();
        assert!(matches!(h.manager.start(), Err(BridgeError::AlreadyStarted)));
        h.manager.stop().await;
    }

    #[tokio::test]
    async fn test_stored_state_is_used() {
        let mut h = harness_with(
            Duration::from_millis(10),
            0,
            MemorySessionStore::with_state(SessionState::from_bytes(b"saved".to_vec())),
        );
        h.manager.start().unwrap();
        let session = next_session(&mut h).await;
        assert_eq!(session.options.state.as_bytes(), b"saved");
    }
}
