use crate::config::ConfigError;
use tokio::time::{Duration, Instant};

/// Text frame the client sends as a keep-alive
pub const PING: &str = "ping";

/// Text frame the server echoes back
pub const PONG: &str = "pong";

/// How a connection keeps itself alive while open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatStrategy {
    /// The client never pings; liveness is left to the transport
    Disabled,
    /// Send a plain-text `"ping"` every `interval`.
    ///
    /// With `pong_timeout` set, a ping not followed by any inbound frame
    /// within the timeout is treated as a dead connection.
    ClientPing {
        interval: Duration,
        pong_timeout: Option<Duration>,
    },
}

impl Default for HeartbeatStrategy {
    fn default() -> Self {
        HeartbeatStrategy::ClientPing {
            interval: Duration::from_secs(30),
            pong_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl HeartbeatStrategy {
    pub(crate) fn validate(&self, channel: &str) -> Result<(), ConfigError> {
        if let HeartbeatStrategy::ClientPing {
            interval,
            pong_timeout,
        } = self
        {
            if interval.is_zero() {
                return Err(ConfigError::InvalidHeartbeat(format!(
                    "{channel}: ping interval must be > 0"
                )));
            }
            if let Some(timeout) = pong_timeout {
                if timeout.is_zero() || timeout >= interval {
                    return Err(ConfigError::InvalidHeartbeat(format!(
                        "{channel}: pong_timeout must be > 0 and < ping interval"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// What the connection should do when the heartbeat deadline passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Nothing due yet
    Wait,
    /// Send a ping now
    SendPing,
    /// The last ping went unanswered past its deadline
    PongOverdue,
}

/// Tracks keep-alive state for a single open connection
#[derive(Debug)]
pub struct HeartbeatMonitor {
    strategy: HeartbeatStrategy,

    /// When the connection opened
    opened_at: Instant,

    /// Time of last ping sent
    last_ping_sent: Option<Instant>,

    /// Whether we're currently waiting for any reply to a ping
    waiting_for_pong: bool,
}

impl HeartbeatMonitor {
    /// Create a monitor for a connection that just opened
    pub fn new(strategy: HeartbeatStrategy) -> Self {
        Self::started_at(strategy, Instant::now())
    }

    fn started_at(strategy: HeartbeatStrategy, now: Instant) -> Self {
        Self {
            strategy,
            opened_at: now,
            last_ping_sent: None,
            waiting_for_pong: false,
        }
    }

    /// Record that we sent a ping
    pub fn record_ping_sent(&mut self, now: Instant) {
        self.last_ping_sent = Some(now);
        self.waiting_for_pong = true;
    }

    /// Record that a frame arrived; any frame proves the peer is alive
    pub fn record_frame(&mut self) {
        self.waiting_for_pong = false;
    }

    /// Whether a ping is outstanding
    pub fn is_waiting_for_pong(&self) -> bool {
        self.waiting_for_pong
    }

    /// Next instant at which [`poll`](Self::poll) has something to do.
    ///
    /// `None` when heartbeats are disabled.
    pub fn next_deadline(&self) -> Option<Instant> {
        let HeartbeatStrategy::ClientPing {
            interval,
            pong_timeout,
        } = &self.strategy
        else {
            return None;
        };

        let last = self.last_ping_sent.unwrap_or(self.opened_at);
        match (self.waiting_for_pong, pong_timeout) {
            (true, Some(timeout)) => Some(last + *timeout),
            _ => Some(last + *interval),
        }
    }

    /// Decide what is due at `now`.
    pub fn poll(&self, now: Instant) -> HeartbeatAction {
        let Some(deadline) = self.next_deadline() else {
            return HeartbeatAction::Wait;
        };
        if now < deadline {
            return HeartbeatAction::Wait;
        }

        let overdue = self.waiting_for_pong
            && matches!(
                self.strategy,
                HeartbeatStrategy::ClientPing {
                    pong_timeout: Some(_),
                    ..
                }
            );
        if overdue {
            HeartbeatAction::PongOverdue
        } else {
            HeartbeatAction::SendPing
        }
    }
}
