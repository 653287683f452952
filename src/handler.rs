use crate::state::ConnectionState;

/// Hooks a [`ConnectionManager`](crate::ConnectionManager) calls while it
/// drives its transport.
///
/// This trait defines the contract between a connection and whatever sits
/// on top of it. The connection handles lifecycle, reconnection and
/// heartbeats, while the handler decides what to announce on open and what
/// to do with inbound frames.
///
/// All hooks run on the connection's driver task and must not block.
///
/// # Example
///
/// ```ignore
/// use progress_sync::{ChannelHandler, ConnectionState};
///
/// struct LogHandler;
///
/// impl ChannelHandler for LogHandler {
///     fn on_frame(&self, text: &str) {
///         tracing::info!("frame: {}", text);
///     }
///
///     fn on_state(&self, state: ConnectionState) {
///         tracing::info!("state: {:?}", state);
///     }
/// }
/// ```
pub trait ChannelHandler: Send + Sync + 'static {
    /// Called after every successful open, including reconnects.
    ///
    /// Returns text frames to send before anything else (e.g. subscription
    /// announcements).
    fn on_open(&self) -> Vec<String> {
        Vec::new()
    }

    /// Called for every inbound text frame, heartbeat replies included.
    fn on_frame(&self, text: &str);

    /// Called whenever the connection state changes.
    fn on_state(&self, _state: ConnectionState) {}
}
