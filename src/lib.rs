//! # progress-sync
//!
//! Keeps locally cached progress snapshots of long-running server jobs in
//! sync over push channels that may drop, stall, or never come up.
//!
//! ## Features
//!
//! - **Two channel families** behind one connection type: one shared
//!   multiplexed connection for translation jobs, one dedicated connection
//!   per book pipeline
//! - **Auto-reconnection** with capped exponential backoff and optional jitter
//! - **Fallback signal** once reconnects are exhausted, so callers can poll
//! - **Heartbeats** with a pong deadline that catches half-open connections
//! - **Field-preserving merges**: an agent's update never clobbers another
//!   agent's counters, and boundary events ask for a refetch instead
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use progress_sync::{SyncConfig, SyncController, SyncEvent, TrackedEntity};
//!
//! let config = SyncConfig::builder()
//!     .base_url("wss://api.example.com/")
//!     .build()?;
//!
//! let controller = SyncController::with_websocket(config);
//! let mut events = controller.events();
//! let mut book = controller.subscribe(TrackedEntity::book_v1("42"));
//!
//! tokio::select! {
//!     Ok(()) = book.changed() => println!("{:?}", *book.borrow()),
//!     Ok(SyncEvent::RefetchRequired { entity }) = events.recv() => {
//!         let fresh = fetch_book(&entity.id).await?;
//!         controller.replace_snapshot(&entity, fresh);
//!     }
//! }
//!
//! controller.unsubscribe(&TrackedEntity::book_v1("42"));
//! ```

mod config;
mod connection;
mod controller;
mod error;
mod handler;
mod heartbeat;
mod merge;
mod metrics;
mod protocol;
mod reconnect;
mod registry;
mod router;
mod state;
mod transport;

#[cfg(test)]
mod testing;

pub use config::{ChannelConfig, ConfigError, EndpointConfig, ReconnectConfig, SyncConfig, SyncConfigBuilder};
pub use connection::ConnectionManager;
pub use controller::{EntityKind, SyncController, SyncEvent, TrackedEntity};
pub use error::{Error, ErrorKind};
pub use handler::ChannelHandler;
pub use heartbeat::{HeartbeatStrategy, PING, PONG};
pub use merge::{merge, replace, MergeOutcome, ProgressSnapshot, FAILED_STATUS, UNKNOWN_ERROR};
pub use metrics::{ConnectionMetrics, Metrics, MetricsSnapshot};
pub use protocol::ClientMessage;
pub use reconnect::{BackoffState, ReconnectPolicy};
pub use registry::{Outbound, SubscriptionRegistry};
pub use router::{DropReason, EventRouter, Routed, RoutedEvent, Update, WireFormat};
pub use state::{ConnectionState, ConnectivityStatus, IllegalTransition, Signal};
pub use transport::{Connector, Transport, WsConnector};

// Re-export http types for handshake headers
pub use http::{HeaderName, HeaderValue};

/// Result type for progress-sync operations
pub type Result<T> = std::result::Result<T, Error>;
