use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for observability
///
/// Counters and per-connection gauges shared by every connection a
/// [`SyncController`](crate::SyncController) owns. Use `snapshot()` to get
/// a point-in-time view of everything.
///
/// # Example
/// ```ignore
/// let metrics = controller.metrics();
///
/// println!("Frames received: {}", metrics.frames_received());
/// println!("Fallbacks: {}", metrics.fallbacks());
///
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    // Counter fields - private, exposed via getters
    connections_total: AtomicU64,
    reconnect_attempts_total: AtomicU64,
    fallbacks_total: AtomicU64,
    frames_received_total: AtomicU64,
    frames_sent_total: AtomicU64,
    frames_dropped_total: AtomicU64,
    errors_total: AtomicU64,
    pings_sent_total: AtomicU64,
    pong_timeouts_total: AtomicU64,
    snapshot_updates_total: AtomicU64,
    refetches_requested_total: AtomicU64,

    /// Per-connection gauges keyed by connection label
    connections: RwLock<HashMap<String, ConnectionMetrics>>,
}

/// Gauges for a single connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetrics {
    /// Connection label (e.g. `book:42`, `translations`)
    pub label: String,
    /// Whether the transport is currently open
    pub is_connected: bool,
    /// Reconnect attempts since the last successful open
    pub reconnect_attempt: u32,
    /// Duration since last successful open (None if never connected)
    pub time_since_connected: Option<Duration>,
    /// Total time spent open
    pub total_uptime: Duration,
    #[doc(hidden)]
    pub(crate) last_connected_at: Option<Instant>,
}

impl ConnectionMetrics {
    fn snapshot(&self) -> ConnectionMetrics {
        ConnectionMetrics {
            time_since_connected: self.last_connected_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Get total successful opens
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Get total scheduled reconnect attempts
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts_total.load(Ordering::Relaxed)
    }

    /// Get total transitions into fallback
    pub fn fallbacks(&self) -> u64 {
        self.fallbacks_total.load(Ordering::Relaxed)
    }

    /// Get total frames received
    pub fn frames_received(&self) -> u64 {
        self.frames_received_total.load(Ordering::Relaxed)
    }

    /// Get total frames sent
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent_total.load(Ordering::Relaxed)
    }

    /// Get total frames dropped (malformed or unknown)
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped_total.load(Ordering::Relaxed)
    }

    /// Get total transport errors
    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    /// Get total pings sent
    pub fn pings_sent(&self) -> u64 {
        self.pings_sent_total.load(Ordering::Relaxed)
    }

    /// Get total pong deadlines missed
    pub fn pong_timeouts(&self) -> u64 {
        self.pong_timeouts_total.load(Ordering::Relaxed)
    }

    /// Get total snapshot merges applied
    pub fn snapshot_updates(&self) -> u64 {
        self.snapshot_updates_total.load(Ordering::Relaxed)
    }

    /// Get total refetch signals raised
    pub fn refetches_requested(&self) -> u64 {
        self.refetches_requested_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect_attempt(&self) {
        self.reconnect_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fallback(&self) {
        self.fallbacks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_received(&self) {
        self.frames_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_sent(&self) {
        self.frames_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_dropped(&self) {
        self.frames_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ping(&self) {
        self.pings_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pong_timeout(&self) {
        self.pong_timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_snapshot_update(&self) {
        self.snapshot_updates_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refetch_requested(&self) {
        self.refetches_requested_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Update gauges for a connection, creating its entry on first use
    pub(crate) fn update_connection(&self, label: &str, update_fn: impl FnOnce(&mut ConnectionMetrics)) {
        let mut connections = self.connections.write();
        let entry = connections
            .entry(label.to_string())
            .or_insert_with(|| ConnectionMetrics {
                label: label.to_string(),
                ..Default::default()
            });
        update_fn(entry);
    }

    /// Forget a connection that was torn down
    pub(crate) fn remove_connection(&self, label: &str) {
        self.connections.write().remove(label);
    }

    /// Get a snapshot of one connection's gauges
    pub fn connection(&self, label: &str) -> Option<ConnectionMetrics> {
        self.connections.read().get(label).map(|c| c.snapshot())
    }

    /// Get current open connection count
    pub fn active_connections(&self) -> usize {
        self.connections
            .read()
            .values()
            .filter(|c| c.is_connected)
            .count()
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        let connections = self.connections.read();
        let mut connection_snapshots: Vec<ConnectionMetrics> =
            connections.values().map(|c| c.snapshot()).collect();
        connection_snapshots.sort_by(|a, b| a.label.cmp(&b.label));

        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnect_attempts_total: self.reconnect_attempts_total.load(Ordering::Acquire),
            fallbacks_total: self.fallbacks_total.load(Ordering::Acquire),
            frames_received_total: self.frames_received_total.load(Ordering::Acquire),
            frames_sent_total: self.frames_sent_total.load(Ordering::Acquire),
            frames_dropped_total: self.frames_dropped_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            pings_sent_total: self.pings_sent_total.load(Ordering::Acquire),
            pong_timeouts_total: self.pong_timeouts_total.load(Ordering::Acquire),
            snapshot_updates_total: self.snapshot_updates_total.load(Ordering::Acquire),
            refetches_requested_total: self.refetches_requested_total.load(Ordering::Acquire),
            active_connections: connection_snapshots.iter().filter(|c| c.is_connected).count(),
            connections: connection_snapshots,
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnect_attempts_total: u64,
    pub fallbacks_total: u64,
    pub frames_received_total: u64,
    pub frames_sent_total: u64,
    pub frames_dropped_total: u64,
    pub errors_total: u64,
    pub pings_sent_total: u64,
    pub pong_timeouts_total: u64,
    pub snapshot_updates_total: u64,
    pub refetches_requested_total: u64,
    pub active_connections: usize,
    pub connections: Vec<ConnectionMetrics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters() {
        let metrics = Metrics::new();

        metrics.record_connection();
        metrics.record_connection();
        metrics.record_reconnect_attempt();
        metrics.record_frame_dropped();

        assert_eq!(metrics.connections(), 2);
        assert_eq!(metrics.reconnect_attempts(), 1);
        assert_eq!(metrics.frames_dropped(), 1);
        assert_eq!(metrics.fallbacks(), 0);
    }

    #[test]
    fn test_connection_gauges() {
        let metrics = Metrics::new();

        metrics.update_connection("book:1", |c| c.is_connected = true);
        metrics.update_connection("translations", |c| {
            c.is_connected = false;
            c.reconnect_attempt = 3;
        });

        assert_eq!(metrics.active_connections(), 1);
        assert_eq!(
            metrics.connection("translations").map(|c| c.reconnect_attempt),
            Some(3)
        );

        metrics.remove_connection("book:1");
        assert!(metrics.connection("book:1").is_none());
        assert_eq!(metrics.active_connections(), 0);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.record_refetch_requested();
        metrics.update_connection("b", |c| {
            c.is_connected = true;
            c.last_connected_at = Some(Instant::now());
        });
        metrics.update_connection("a", |_| {});

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.refetches_requested_total, 1);
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.connections[0].label, "a");
        assert!(snapshot.connections[1].time_since_connected.is_some());
    }
}
