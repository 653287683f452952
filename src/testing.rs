//! Scripted transports and recording hooks for unit tests.

use crate::error::Error;
use crate::handler::ChannelHandler;
use crate::registry::Outbound;
use crate::state::ConnectionState;
use crate::transport::{Connector, Transport};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

struct ConnectorInner {
    attempts: AtomicUsize,
    failing: AtomicBool,
    hanging: AtomicBool,
    links_tx: mpsc::UnboundedSender<ServerSide>,
    links_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerSide>>,
}

/// Connector that counts attempts and hands every opened link to the test.
#[derive(Clone)]
pub(crate) struct FakeConnector {
    inner: Arc<ConnectorInner>,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ConnectorInner {
                attempts: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
                hanging: AtomicBool::new(false),
                links_tx,
                links_rx: tokio::sync::Mutex::new(links_rx),
            }),
        }
    }

    /// A connector whose every attempt is refused
    pub(crate) fn failing() -> Self {
        let connector = Self::new();
        connector.set_failing(true);
        connector
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// Handshakes never complete, leaving the connect timeout to fire
    pub(crate) fn hanging() -> Self {
        let connector = Self::new();
        connector.inner.hanging.store(true, Ordering::SeqCst);
        connector
    }

    pub(crate) fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Wait for the next successfully opened link
    pub(crate) async fn next_link(&self) -> ServerSide {
        self.inner
            .links_rx
            .lock()
            .await
            .recv()
            .await
            .expect("connector outlives its links")
    }
}

impl Connector for FakeConnector {
    async fn connect(&self, url: &Url) -> Result<Transport, Error> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        if self.inner.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(Error::connection_failed(url.as_str(), "refused"));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let _ = self.inner.links_tx.send(ServerSide {
            url: url.clone(),
            sent: outbound_rx,
            push: inbound_tx,
        });
        Ok(Transport::from_channels(outbound_tx, inbound_rx))
    }
}

/// The server end of a fake link. Dropping it closes the connection.
pub(crate) struct ServerSide {
    pub(crate) url: Url,
    sent: mpsc::UnboundedReceiver<Message>,
    push: mpsc::UnboundedSender<Result<Message, Error>>,
}

impl ServerSide {
    /// Next text frame the client sent, or `None` once the client hung up
    pub(crate) async fn next_text(&mut self) -> Option<String> {
        loop {
            if let Message::Text(text) = self.sent.recv().await? {
                return Some(text);
            }
        }
    }

    /// Every text frame sent so far, without waiting
    pub(crate) fn drain_texts(&mut self) -> Vec<String> {
        let mut texts = Vec::new();
        while let Ok(message) = self.sent.try_recv() {
            if let Message::Text(text) = message {
                texts.push(text);
            }
        }
        texts
    }

    pub(crate) fn push_text(&self, text: &str) {
        let _ = self.push.send(Ok(Message::Text(text.to_string())));
    }
}

/// Handler that records everything it sees
pub(crate) struct RecordingHandler {
    announcements: Vec<String>,
    frames: Mutex<Vec<String>>,
    states: Mutex<Vec<ConnectionState>>,
    frame_count: watch::Sender<usize>,
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self::with_announcements(Vec::new())
    }
}

impl RecordingHandler {
    pub(crate) fn with_announcements(announcements: Vec<String>) -> Self {
        Self {
            announcements,
            frames: Mutex::new(Vec::new()),
            states: Mutex::new(Vec::new()),
            frame_count: watch::channel(0).0,
        }
    }

    pub(crate) fn frames(&self) -> Vec<String> {
        self.frames.lock().clone()
    }

    pub(crate) fn states(&self) -> Vec<ConnectionState> {
        self.states.lock().clone()
    }

    pub(crate) async fn wait_for_frames(&self, count: usize) {
        let mut rx = self.frame_count.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }
}

impl ChannelHandler for RecordingHandler {
    fn on_open(&self) -> Vec<String> {
        self.announcements.clone()
    }

    fn on_frame(&self, text: &str) {
        self.frames.lock().push(text.to_string());
        self.frame_count.send_modify(|n| *n += 1);
    }

    fn on_state(&self, state: ConnectionState) {
        self.states.lock().push(state);
    }
}

/// Outbound channel that records what it was asked to send
#[derive(Default)]
pub(crate) struct RecordingOutbound {
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl RecordingOutbound {
    pub(crate) fn open() -> Self {
        let outbound = Self::default();
        outbound.set_open(true);
        outbound
    }

    pub(crate) fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

impl Outbound for RecordingOutbound {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send_text(&self, text: String) -> bool {
        if !self.is_open() {
            return false;
        }
        self.sent.lock().push(text);
        true
    }
}
