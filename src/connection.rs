use crate::config::ChannelConfig;
use crate::error::Error;
use crate::handler::ChannelHandler;
use crate::heartbeat::{HeartbeatAction, HeartbeatMonitor, HeartbeatStrategy, PING};
use crate::metrics::Metrics;
use crate::reconnect::{BackoffState, ReconnectPolicy};
use crate::state::{ConnectionState, Signal};
use crate::transport::{Connector, Transport};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// Commands from the handle to its driver task
#[derive(Debug)]
enum ConnectionCommand {
    /// Send a text frame
    Send(String),
    /// Reset backoff and connect again now
    Reconnect,
}

/// How an open session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Transport closed, errored, or stopped answering pings
    Lost,
    /// Owner asked for a fresh connection
    Restart,
    /// Handle is gone; stop driving
    Stopped,
}

/// State shared between the handle and the driver task
struct Shared {
    label: String,
    state_tx: watch::Sender<ConnectionState>,
    /// Cleared by `close()`; the driver checks it before every action
    alive: AtomicBool,
    handler: Arc<dyn ChannelHandler>,
}

impl Shared {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Apply `signal` to the current state and publish the result.
    ///
    /// Returns `false` for illegal transitions and for a connection that has
    /// already been closed.
    fn transition(&self, signal: Signal) -> bool {
        let mut next = None;
        let mut illegal = None;
        self.state_tx.send_if_modified(|current| {
            if !self.is_alive() {
                return false;
            }
            match current.on(signal) {
                Ok(state) if state == *current => false,
                Ok(state) => {
                    *current = state;
                    next = Some(state);
                    true
                }
                Err(e) => {
                    illegal = Some(e);
                    false
                }
            }
        });

        if let Some(e) = illegal {
            warn!("[{}] Ignoring {}", self.label, e);
            return false;
        }
        if let Some(state) = next {
            trace!("[{}] State -> {:?}", self.label, state);
            self.handler.on_state(state);
        }
        self.is_alive()
    }
}

struct Running {
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    task: JoinHandle<()>,
}

/// Owns exactly one transport connection and its timers.
///
/// The same type serves per-entity channels and the shared multiplexed
/// channel; they differ only in the [`ChannelConfig`] (reconnect policy and
/// heartbeat strategy) and the [`ChannelHandler`] plugged in.
///
/// Every operation is synchronous and returns immediately. Connection
/// progress is observed through [`state`](Self::state),
/// [`watch_state`](Self::watch_state) and the handler's `on_state` hook.
pub struct ConnectionManager<C: Connector> {
    url: Url,
    connector: Arc<C>,
    channel: ChannelConfig,
    connect_timeout: Duration,
    metrics: Arc<Metrics>,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a manager in the `Idle` state. Nothing connects until
    /// [`open`](Self::open).
    pub fn new(
        label: impl Into<String>,
        url: Url,
        connector: Arc<C>,
        channel: ChannelConfig,
        connect_timeout: Duration,
        handler: Arc<dyn ChannelHandler>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            url,
            connector,
            channel,
            connect_timeout,
            metrics,
            shared: Arc::new(Shared {
                label: label.into(),
                state_tx,
                alive: AtomicBool::new(false),
                handler,
            }),
            running: Mutex::new(None),
        }
    }

    /// Connection label used in logs and metrics
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Target URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Watch state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Whether frames can be sent right now
    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Start connecting.
    ///
    /// Moves `Idle` to `Connecting` and spawns the driver task. A no-op if
    /// the connection is already running. Never fails: a transport that
    /// cannot be constructed goes down the reconnect path.
    pub fn open(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            trace!("[{}] Already running", self.shared.label);
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                error!("[{}] Cannot open connection: {}", self.shared.label, Error::NoRuntime);
                return;
            }
        };

        self.shared.alive.store(true, Ordering::Release);
        self.shared.transition(Signal::Connect);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            url: self.url.clone(),
            connector: self.connector.clone(),
            policy: ReconnectPolicy::new(self.channel.reconnect.clone()),
            heartbeat: self.channel.heartbeat.clone(),
            connect_timeout: self.connect_timeout,
            metrics: self.metrics.clone(),
            shared: self.shared.clone(),
            commands: command_rx,
            backoff: BackoffState::default(),
        };

        debug!("[{}] Opening connection to {}", self.shared.label, self.url);
        let task = runtime.spawn(driver.run());
        *running = Some(Running {
            commands: command_tx,
            task,
        });
    }

    /// Send a text frame.
    ///
    /// Best-effort: returns `false` and drops the frame when the connection
    /// is not `Open`.
    pub fn send(&self, text: impl Into<String>) -> bool {
        if !self.is_open() {
            trace!("[{}] Not open, dropping outbound frame", self.shared.label);
            return false;
        }
        match self.running.lock().as_ref() {
            Some(running) => running
                .commands
                .send(ConnectionCommand::Send(text.into()))
                .is_ok(),
            None => false,
        }
    }

    /// Reset backoff and connect again.
    ///
    /// Leaves `Fallback`, skips a pending reconnect delay, or replaces an
    /// open transport with a fresh one. Opens the connection if it is idle.
    pub fn reconnect(&self) {
        let sent = self
            .running
            .lock()
            .as_ref()
            .map(|running| running.commands.send(ConnectionCommand::Reconnect).is_ok())
            .unwrap_or(false);

        if !sent {
            self.close();
            self.open();
        }
    }

    /// Tear down: cancel the heartbeat and any pending reconnect, drop the
    /// transport, move to `Idle`. Idempotent.
    pub fn close(&self) {
        self.shared.alive.store(false, Ordering::Release);

        if let Some(running) = self.running.lock().take() {
            running.task.abort();
            info!("[{}] Connection closed", self.shared.label);
        }

        let previous = self.shared.state_tx.send_replace(ConnectionState::Idle);
        if previous != ConnectionState::Idle {
            self.shared.handler.on_state(ConnectionState::Idle);
        }
        self.metrics.remove_connection(&self.shared.label);
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        // Abort the driver task to prevent an orphaned reconnect loop
        if let Some(running) = self.running.get_mut().take() {
            self.shared.alive.store(false, Ordering::Release);
            running.task.abort();
        }
    }
}

/// The task that owns the transport for one [`ConnectionManager`]
struct Driver<C: Connector> {
    url: Url,
    connector: Arc<C>,
    policy: ReconnectPolicy,
    heartbeat: HeartbeatStrategy,
    connect_timeout: Duration,
    metrics: Arc<Metrics>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    backoff: BackoffState,
}

impl<C: Connector> Driver<C> {
    fn label(&self) -> &str {
        &self.shared.label
    }

    /// Connect, run, and reconnect until closed or exhausted.
    async fn run(mut self) {
        loop {
            if !self.shared.is_alive() {
                return;
            }

            let end = match timeout(self.connect_timeout, self.connector.connect(&self.url)).await {
                Ok(Ok(transport)) => self.run_session(transport).await,
                Ok(Err(e)) => {
                    self.metrics.record_error();
                    debug!(
                        "[{}] Connect failed ({:?}): {}",
                        self.label(),
                        e.kind(),
                        e
                    );
                    SessionEnd::Lost
                }
                Err(_) => {
                    self.metrics.record_error();
                    let e = Error::ConnectTimeout(self.connect_timeout);
                    debug!("[{}] Connect failed ({:?}): {}", self.label(), e.kind(), e);
                    SessionEnd::Lost
                }
            };

            if end == SessionEnd::Stopped || !self.shared.transition(Signal::TransportLost) {
                return;
            }

            if end == SessionEnd::Restart {
                self.backoff.reset();
            } else {
                match self.policy.next_delay(&mut self.backoff) {
                    Some(delay) => {
                        self.metrics.record_reconnect_attempt();
                        self.metrics.update_connection(self.label(), |c| {
                            c.reconnect_attempt = self.backoff.attempt;
                        });
                        debug!(
                            "[{}] Reconnecting in {:?} (attempt {})",
                            self.label(),
                            delay,
                            self.backoff.attempt
                        );
                        if !self.wait_for_retry(delay).await {
                            return;
                        }
                    }
                    None => {
                        if !self.shared.transition(Signal::RetriesExhausted) {
                            return;
                        }
                        self.metrics.record_fallback();
                        warn!(
                            "[{}] Reconnect attempts exhausted after {}, falling back",
                            self.label(),
                            self.backoff.attempt
                        );
                        if !self.wait_for_manual_reconnect().await {
                            return;
                        }
                    }
                }
            }

            if !self.shared.transition(Signal::Connect) {
                return;
            }
        }
    }

    /// Sleep out a reconnect delay. A manual reconnect cuts it short.
    ///
    /// Returns `false` if the driver should stop.
    async fn wait_for_retry(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return self.shared.is_alive(),
                cmd = self.commands.recv() => match cmd {
                    Some(ConnectionCommand::Reconnect) => {
                        info!("[{}] Manual reconnect, skipping backoff", self.shared.label);
                        self.backoff.reset();
                        return self.shared.is_alive();
                    }
                    Some(ConnectionCommand::Send(_)) => {
                        trace!("[{}] Reconnecting, dropping outbound frame", self.shared.label);
                    }
                    None => return false,
                },
            }
        }
    }

    /// Park in `Fallback` until a manual reconnect arrives.
    async fn wait_for_manual_reconnect(&mut self) -> bool {
        loop {
            match self.commands.recv().await {
                Some(ConnectionCommand::Reconnect) => {
                    info!("[{}] Manual reconnect from fallback", self.shared.label);
                    self.backoff.reset();
                    return self.shared.is_alive();
                }
                Some(ConnectionCommand::Send(_)) => {
                    trace!("[{}] In fallback, dropping outbound frame", self.shared.label);
                }
                None => return false,
            }
        }
    }

    /// Drive one open transport until it ends
    async fn run_session(&mut self, mut transport: Transport) -> SessionEnd {
        if !self.shared.transition(Signal::TransportOpened) {
            return SessionEnd::Stopped;
        }
        self.backoff.reset();
        self.metrics.record_connection();
        let connected_at = StdInstant::now();
        self.metrics.update_connection(self.label(), |c| {
            c.is_connected = true;
            c.reconnect_attempt = 0;
            c.last_connected_at = Some(connected_at);
        });
        info!("[{}] Connected to {}", self.label(), self.url);

        for text in self.shared.handler.on_open() {
            if !transport.send(Message::Text(text)) {
                return self.end_session(SessionEnd::Lost, connected_at);
            }
            self.metrics.record_frame_sent();
        }

        let mut heartbeat = HeartbeatMonitor::new(self.heartbeat.clone());

        let end = loop {
            let deadline = heartbeat.next_deadline();
            let heartbeat_sleep = tokio::time::sleep_until(
                deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600)),
            );

            tokio::select! {
                frame = transport.recv() => {
                    match frame {
                        Some(Ok(message)) => {
                            heartbeat.record_frame();
                            match message {
                                Message::Text(text) => self.deliver(&text),
                                Message::Binary(data) => match String::from_utf8(data) {
                                    Ok(text) => self.deliver(&text),
                                    Err(_) => {
                                        self.metrics.record_frame_dropped();
                                        debug!("[{}] Dropping non-UTF-8 binary frame", self.label());
                                    }
                                },
                                Message::Close(frame) => {
                                    info!("[{}] Received close frame: {:?}", self.label(), frame);
                                    break SessionEnd::Lost;
                                }
                                // Protocol-level ping/pong are answered by tungstenite
                                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                            }
                        }
                        Some(Err(e)) => {
                            self.metrics.record_error();
                            warn!("[{}] Transport error: {}", self.label(), e);
                            break SessionEnd::Lost;
                        }
                        None => {
                            info!("[{}] Transport stream ended", self.label());
                            break SessionEnd::Lost;
                        }
                    }
                }

                cmd = self.commands.recv() => {
                    match cmd {
                        Some(ConnectionCommand::Send(text)) => {
                            if !transport.send(Message::Text(text)) {
                                warn!("[{}] Failed to send frame", self.label());
                                break SessionEnd::Lost;
                            }
                            self.metrics.record_frame_sent();
                        }
                        Some(ConnectionCommand::Reconnect) => {
                            info!("[{}] Received reconnect command", self.label());
                            break SessionEnd::Restart;
                        }
                        None => break SessionEnd::Stopped,
                    }
                }

                _ = heartbeat_sleep, if deadline.is_some() => {
                    let now = Instant::now();
                    match heartbeat.poll(now) {
                        HeartbeatAction::Wait => {}
                        HeartbeatAction::SendPing => {
                            if !transport.send(Message::Text(PING.to_string())) {
                                warn!("[{}] Failed to send ping", self.label());
                                break SessionEnd::Lost;
                            }
                            heartbeat.record_ping_sent(now);
                            self.metrics.record_ping();
                            trace!("[{}] Sent ping", self.label());
                        }
                        HeartbeatAction::PongOverdue => {
                            self.metrics.record_pong_timeout();
                            warn!("[{}] No reply to ping, treating connection as dead", self.label());
                            break SessionEnd::Lost;
                        }
                    }
                }
            }
        };

        self.end_session(end, connected_at)
    }

    fn end_session(&self, end: SessionEnd, connected_at: StdInstant) -> SessionEnd {
        self.metrics.update_connection(self.label(), |c| {
            c.is_connected = false;
            c.total_uptime += connected_at.elapsed();
        });
        end
    }

    fn deliver(&self, text: &str) {
        self.metrics.record_frame_received();
        if !self.shared.transition(Signal::FrameReceived) {
            return;
        }
        self.shared.handler.on_frame(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectConfig;
    use crate::testing::{FakeConnector, RecordingHandler};

    fn manager(
        connector: &FakeConnector,
        channel: ChannelConfig,
        handler: Arc<RecordingHandler>,
    ) -> ConnectionManager<FakeConnector> {
        ConnectionManager::new(
            "test",
            Url::parse("ws://localhost/ws/test").unwrap(),
            Arc::new(connector.clone()),
            channel,
            Duration::from_secs(10),
            handler,
            Arc::new(Metrics::new()),
        )
    }

    fn limited(max_attempts: u32) -> ChannelConfig {
        ChannelConfig {
            reconnect: ReconnectConfig {
                max_attempts: Some(max_attempts),
                ..ReconnectConfig::default()
            },
            heartbeat: HeartbeatStrategy::Disabled,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_delivers_frames() {
        let connector = FakeConnector::new();
        let handler = Arc::new(RecordingHandler::with_announcements(vec!["hello".into()]));
        let conn = manager(&connector, limited(3), handler.clone());

        conn.open();
        assert_eq!(conn.state(), ConnectionState::Connecting);

        let mut server = connector.next_link().await;
        assert_eq!(server.next_text().await.as_deref(), Some("hello"));
        assert_eq!(conn.state(), ConnectionState::Open);

        server.push_text(r#"{"event":"status_change"}"#);
        handler.wait_for_frames(1).await;
        assert_eq!(handler.frames(), vec![r#"{"event":"status_change"}"#.to_string()]);

        assert!(conn.send("outbound"));
        assert_eq!(server.next_text().await.as_deref(), Some("outbound"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_is_noop_when_not_open() {
        let connector = FakeConnector::failing();
        let conn = manager(&connector, limited(3), Arc::new(RecordingHandler::default()));

        assert!(!conn.send("early"));
        conn.open();
        assert!(!conn.send("while connecting"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_terminal() {
        let connector = FakeConnector::failing();
        let handler = Arc::new(RecordingHandler::default());
        let conn = manager(&connector, limited(3), handler.clone());
        let mut state = conn.watch_state();

        conn.open();
        state
            .wait_for(|s| *s == ConnectionState::Fallback)
            .await
            .unwrap();

        // One initial open plus three scheduled retries
        assert_eq!(connector.attempts(), 4);
        assert_eq!(
            handler
                .states()
                .iter()
                .filter(|s| **s == ConnectionState::Fallback)
                .count(),
            1
        );

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.attempts(), 4);
        assert_eq!(conn.state(), ConnectionState::Fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_handshake_times_out() {
        let connector = FakeConnector::hanging();
        let metrics = Arc::new(Metrics::new());
        let conn = ConnectionManager::new(
            "test",
            Url::parse("ws://localhost/ws/test").unwrap(),
            Arc::new(connector.clone()),
            limited(3),
            Duration::from_secs(10),
            Arc::new(RecordingHandler::default()),
            metrics.clone(),
        );
        let mut state = conn.watch_state();
        let started = tokio::time::Instant::now();

        conn.open();
        state
            .wait_for(|s| *s == ConnectionState::Reconnecting)
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(connector.attempts(), 1);
        assert_eq!(metrics.errors(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_leaves_fallback() {
        let connector = FakeConnector::failing();
        let conn = manager(&connector, limited(1), Arc::new(RecordingHandler::default()));
        let mut state = conn.watch_state();

        conn.open();
        state
            .wait_for(|s| *s == ConnectionState::Fallback)
            .await
            .unwrap();
        assert_eq!(connector.attempts(), 2);

        connector.set_failing(false);
        conn.reconnect();
        state.wait_for(|s| *s == ConnectionState::Open).await.unwrap();
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_open() {
        let connector = FakeConnector::new();
        let conn = manager(&connector, limited(2), Arc::new(RecordingHandler::default()));
        let mut state = conn.watch_state();

        conn.open();
        // Three open-then-drop cycles: more than max_attempts, but each
        // successful open resets the count, so fallback never happens.
        for _ in 0..3 {
            let server = connector.next_link().await;
            state.wait_for(|s| *s == ConnectionState::Open).await.unwrap();
            drop(server);
            state
                .wait_for(|s| *s == ConnectionState::Reconnecting)
                .await
                .unwrap();
        }
        let _server = connector.next_link().await;
        state.wait_for(|s| *s == ConnectionState::Open).await.unwrap();
        assert_eq!(connector.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_reconnect() {
        let connector = FakeConnector::failing();
        let conn = manager(&connector, limited(10), Arc::new(RecordingHandler::default()));
        let mut state = conn.watch_state();

        conn.open();
        state
            .wait_for(|s| *s == ConnectionState::Reconnecting)
            .await
            .unwrap();
        assert_eq!(connector.attempts(), 1);

        conn.close();
        assert_eq!(conn.state(), ConnectionState::Idle);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(conn.state(), ConnectionState::Idle);

        // Idempotent
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_pings_and_pong_deadline() {
        let connector = FakeConnector::new();
        let channel = ChannelConfig {
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatStrategy::ClientPing {
                interval: Duration::from_secs(30),
                pong_timeout: Some(Duration::from_secs(10)),
            },
        };
        let conn = manager(&connector, channel, Arc::new(RecordingHandler::default()));
        let mut state = conn.watch_state();

        conn.open();
        let mut server = connector.next_link().await;

        assert_eq!(server.next_text().await.as_deref(), Some("ping"));
        server.push_text("pong");
        assert_eq!(server.next_text().await.as_deref(), Some("ping"));

        // Stay silent: the pong deadline fires and the connection is dropped
        state
            .wait_for(|s| *s == ConnectionState::Reconnecting)
            .await
            .unwrap();
        let _next = connector.next_link().await;
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replaces_open_transport() {
        let connector = FakeConnector::new();
        let conn = manager(&connector, limited(3), Arc::new(RecordingHandler::default()));

        conn.open();
        let mut first = connector.next_link().await;
        let mut state = conn.watch_state();
        state.wait_for(|s| *s == ConnectionState::Open).await.unwrap();

        conn.reconnect();
        let _second = connector.next_link().await;
        assert!(first.next_text().await.is_none());
        assert_eq!(connector.attempts(), 2);
    }
}
