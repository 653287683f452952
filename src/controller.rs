//! Composition root: tracked entities, their channels, and their snapshots.

use crate::config::SyncConfig;
use crate::connection::ConnectionManager;
use crate::handler::ChannelHandler;
use crate::merge::{self, MergeOutcome, ProgressSnapshot};
use crate::metrics::Metrics;
use crate::registry::SubscriptionRegistry;
use crate::router::{EventRouter, Routed, RoutedEvent, Update, WireFormat};
use crate::state::{ConnectionState, ConnectivityStatus};
use crate::transport::{Connector, WsConnector};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, trace};

/// Label of the shared translation-job connection
const SHARED_LABEL: &str = "translations";

/// Which pipeline an entity belongs to, and so which channel carries it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Carried on the shared multiplexed channel
    TranslationJob,
    /// Dedicated channel with `{"event","data"}` envelopes
    BookPipelineV1,
    /// Dedicated channel with flat agent updates
    BookPipelineV2,
}

impl EntityKind {
    pub fn is_multiplexed(self) -> bool {
        self == EntityKind::TranslationJob
    }

    fn wire_format(self) -> WireFormat {
        match self {
            EntityKind::TranslationJob => WireFormat::Multiplexed,
            EntityKind::BookPipelineV1 => WireFormat::Enveloped,
            EntityKind::BookPipelineV2 => WireFormat::Flat,
        }
    }
}

/// One job or pipeline being observed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackedEntity {
    pub id: String,
    pub kind: EntityKind,
}

impl TrackedEntity {
    pub fn new(id: impl Into<String>, kind: EntityKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    pub fn translation(id: impl Into<String>) -> Self {
        Self::new(id, EntityKind::TranslationJob)
    }

    pub fn book_v1(id: impl Into<String>) -> Self {
        Self::new(id, EntityKind::BookPipelineV1)
    }

    pub fn book_v2(id: impl Into<String>) -> Self {
        Self::new(id, EntityKind::BookPipelineV2)
    }
}

/// Notifications broadcast to every [`SyncController::events`] receiver
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A channel's connectivity changed. `entity` is `None` for the shared
    /// translation channel.
    Connectivity {
        entity: Option<TrackedEntity>,
        status: ConnectivityStatus,
    },
    /// Fetch the entity and hand the result to
    /// [`SyncController::replace_snapshot`]
    RefetchRequired { entity: TrackedEntity },
    /// A recognized server event, merged or not. Channel-wide events carry
    /// no entity.
    Server {
        entity: Option<TrackedEntity>,
        name: String,
        payload: Value,
    },
}

struct Entity {
    observers: usize,
    snapshot: watch::Sender<ProgressSnapshot>,
    connectivity: watch::Sender<ConnectivityStatus>,
}

/// State reachable from connection driver tasks.
///
/// Entities are keyed by kind and ID: a book pipeline and a translation job
/// may share an ID without sharing a snapshot.
struct Core {
    entities: Mutex<HashMap<TrackedEntity, Entity>>,
    registry: SubscriptionRegistry,
    shared_status: watch::Sender<ConnectivityStatus>,
    events: broadcast::Sender<SyncEvent>,
    metrics: Arc<Metrics>,
}

impl Core {
    /// Count one more observer. Returns the snapshot receiver and whether
    /// the entity is new.
    fn track(&self, entity: &TrackedEntity) -> (watch::Receiver<ProgressSnapshot>, bool) {
        let mut entities = self.entities.lock();
        if let Some(existing) = entities.get_mut(entity) {
            existing.observers += 1;
            return (existing.snapshot.subscribe(), false);
        }

        let initial = if entity.kind.is_multiplexed() {
            *self.shared_status.borrow()
        } else {
            ConnectivityStatus::Connecting
        };
        let (snapshot, receiver) = watch::channel(ProgressSnapshot::pending(Utc::now()));
        entities.insert(
            entity.clone(),
            Entity {
                observers: 1,
                snapshot,
                connectivity: watch::channel(initial).0,
            },
        );
        (receiver, true)
    }

    /// Drop one observer. Returns whether it was the last one, or `None` if
    /// the entity is not tracked.
    fn untrack(&self, entity: &TrackedEntity) -> Option<bool> {
        let mut entities = self.entities.lock();
        let tracked = entities.get_mut(entity)?;
        tracked.observers = tracked.observers.saturating_sub(1);
        if tracked.observers > 0 {
            return Some(false);
        }
        entities.remove(entity);
        Some(true)
    }

    /// Route one frame from a channel carrying entities of `kind`
    fn handle_frame(&self, router: &EventRouter, kind: EntityKind, text: &str) {
        match router.route(text) {
            Routed::Heartbeat => {}
            Routed::Control(name) => trace!("Control message: {}", name),
            Routed::Dropped(reason) => {
                self.metrics.record_frame_dropped();
                trace!("Frame dropped: {:?}", reason);
            }
            Routed::Event(event) => self.apply(event, kind),
        }
    }

    fn apply(&self, event: RoutedEvent, kind: EntityKind) {
        let RoutedEvent {
            entity_id,
            name,
            payload,
            update,
        } = event;

        let entity = entity_id.map(|id| TrackedEntity::new(id, kind));
        if let (Some(entity), Some(update)) = (&entity, &update) {
            self.merge_into(entity, update);
        }
        let _ = self.events.send(SyncEvent::Server {
            entity,
            name,
            payload,
        });
    }

    fn merge_into(&self, entity: &TrackedEntity, update: &Update) {
        let refetch = {
            let entities = self.entities.lock();
            let Some(tracked) = entities.get(entity) else {
                trace!("Update for untracked {:?} {}", entity.kind, entity.id);
                return;
            };

            let outcome = {
                let current = tracked.snapshot.borrow();
                merge::merge(&current, update, Utc::now())
            };
            match outcome {
                MergeOutcome::Updated(next) => {
                    tracked.snapshot.send_replace(next);
                    self.metrics.record_snapshot_update();
                    false
                }
                MergeOutcome::RefetchRequired => true,
            }
        };

        if refetch {
            self.metrics.record_refetch_requested();
            debug!("Refetch required for {:?} {}", entity.kind, entity.id);
            let _ = self.events.send(SyncEvent::RefetchRequired {
                entity: entity.clone(),
            });
        }
    }

    /// State change on a dedicated channel
    fn entity_state(&self, entity: &TrackedEntity, state: ConnectionState) {
        // Idle only follows a teardown
        if state == ConnectionState::Idle {
            return;
        }

        let changed = {
            let entities = self.entities.lock();
            match entities.get(entity) {
                Some(tracked) => publish(&tracked.connectivity, state),
                None => None,
            }
        };
        if let Some(status) = changed {
            let _ = self.events.send(SyncEvent::Connectivity {
                entity: Some(entity.clone()),
                status,
            });
        }
    }

    /// State change on the shared channel, fanned out to every translation job
    fn shared_state(&self, state: ConnectionState) {
        if state == ConnectionState::Idle {
            return;
        }

        let Some(status) = publish(&self.shared_status, state) else {
            return;
        };
        for (entity, tracked) in self.entities.lock().iter() {
            if entity.kind.is_multiplexed() {
                tracked.connectivity.send_replace(status);
            }
        }
        let _ = self.events.send(SyncEvent::Connectivity { entity: None, status });
    }
}

/// Fold a connection state into a connectivity channel.
///
/// Retrying after a loss stays `Reconnecting` until the channel is open
/// again. Returns the new status if it changed.
fn publish(
    connectivity: &watch::Sender<ConnectivityStatus>,
    state: ConnectionState,
) -> Option<ConnectivityStatus> {
    let mut published = None;
    connectivity.send_if_modified(|current| {
        let next = match (*current, state.connectivity()) {
            (ConnectivityStatus::Reconnecting, ConnectivityStatus::Connecting) => {
                ConnectivityStatus::Reconnecting
            }
            (_, next) => next,
        };
        if next == *current {
            return false;
        }
        *current = next;
        published = Some(next);
        true
    });
    published
}

struct DedicatedHandler {
    entity: TrackedEntity,
    router: EventRouter,
    core: Arc<Core>,
}

impl ChannelHandler for DedicatedHandler {
    fn on_frame(&self, text: &str) {
        self.core.handle_frame(&self.router, self.entity.kind, text);
    }

    fn on_state(&self, state: ConnectionState) {
        self.core.entity_state(&self.entity, state);
    }
}

struct SharedHandler {
    router: EventRouter,
    core: Arc<Core>,
}

impl ChannelHandler for SharedHandler {
    fn on_open(&self) -> Vec<String> {
        self.core.registry.announcements()
    }

    fn on_frame(&self, text: &str) {
        self.core
            .handle_frame(&self.router, EntityKind::TranslationJob, text);
    }

    fn on_state(&self, state: ConnectionState) {
        self.core.shared_state(state);
    }
}

struct Channels<C: Connector> {
    dedicated: HashMap<TrackedEntity, ConnectionManager<C>>,
    shared: Option<ConnectionManager<C>>,
}

/// Keeps a cached snapshot of every tracked entity in sync with the server.
///
/// Book pipelines get one dedicated connection each. Translation jobs share
/// one connection, opened with the first translation subscription and
/// closed when the last one goes away.
///
/// All methods are synchronous and must be called within a tokio runtime.
///
/// # Example
///
/// ```ignore
/// use progress_sync::{SyncConfig, SyncController, TrackedEntity};
///
/// let controller = SyncController::with_websocket(SyncConfig::default());
/// let mut snapshot = controller.subscribe(TrackedEntity::book_v1("42"));
///
/// while snapshot.changed().await.is_ok() {
///     println!("{:?}", *snapshot.borrow());
/// }
/// ```
pub struct SyncController<C: Connector> {
    config: SyncConfig,
    connector: Arc<C>,
    core: Arc<Core>,
    channels: Mutex<Channels<C>>,
}

impl SyncController<WsConnector> {
    /// Controller over real WebSocket connections
    pub fn with_websocket(config: SyncConfig) -> Self {
        Self::new(config, WsConnector::new())
    }
}

impl<C: Connector> SyncController<C> {
    pub fn new(config: SyncConfig, connector: C) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            connector: Arc::new(connector),
            core: Arc::new(Core {
                entities: Mutex::new(HashMap::new()),
                registry: SubscriptionRegistry::new(),
                shared_status: watch::channel(ConnectivityStatus::Connecting).0,
                events,
                metrics: Arc::new(Metrics::new()),
            }),
            channels: Mutex::new(Channels {
                dedicated: HashMap::new(),
                shared: None,
            }),
            config,
        }
    }

    /// Start observing `entity`.
    ///
    /// Each call counts as one observer and must be paired with an
    /// [`unsubscribe`](Self::unsubscribe). The first observer opens (or
    /// joins) the entity's channel.
    pub fn subscribe(&self, entity: TrackedEntity) -> watch::Receiver<ProgressSnapshot> {
        let mut channels = self.channels.lock();

        if entity.kind.is_multiplexed() {
            // Channel first, so a new entity starts from its current status
            let shared = self.shared_connection(&mut channels);
            let (receiver, _) = self.core.track(&entity);
            if let Some(shared) = shared {
                self.core.registry.acquire(&entity.id, shared);
            }
            return receiver;
        }

        let (receiver, first) = self.core.track(&entity);
        if first {
            self.open_dedicated(&mut channels, &entity);
        }
        receiver
    }

    /// Drop one observer of `entity`. The last one tears the entity down:
    /// its dedicated connection is closed with any pending reconnect, or its
    /// shared-channel subscription is released. Untracked entities are
    /// ignored.
    pub fn unsubscribe(&self, entity: &TrackedEntity) {
        let mut channels = self.channels.lock();
        let Some(last) = self.core.untrack(entity) else {
            trace!("Unsubscribe for untracked {:?} {}", entity.kind, entity.id);
            return;
        };

        if entity.kind.is_multiplexed() {
            if let Some(shared) = channels.shared.as_ref() {
                self.core.registry.release(&entity.id, shared);
            }
            if self.core.registry.is_empty() {
                if let Some(shared) = channels.shared.take() {
                    info!("No translation jobs left, closing shared channel");
                    shared.close();
                }
            }
        } else if last {
            if let Some(conn) = channels.dedicated.remove(entity) {
                conn.close();
            }
        }

        if last {
            debug!("Stopped tracking {:?} {}", entity.kind, entity.id);
        }
    }

    /// Current snapshot of a tracked entity
    pub fn snapshot(&self, entity: &TrackedEntity) -> Option<ProgressSnapshot> {
        self.core
            .entities
            .lock()
            .get(entity)
            .map(|e| e.snapshot.borrow().clone())
    }

    /// Current connectivity of a tracked entity's channel
    pub fn connectivity(&self, entity: &TrackedEntity) -> Option<ConnectivityStatus> {
        self.core
            .entities
            .lock()
            .get(entity)
            .map(|e| *e.connectivity.borrow())
    }

    /// Watch connectivity of a tracked entity's channel
    pub fn watch_connectivity(
        &self,
        entity: &TrackedEntity,
    ) -> Option<watch::Receiver<ConnectivityStatus>> {
        self.core
            .entities
            .lock()
            .get(entity)
            .map(|e| e.connectivity.subscribe())
    }

    pub fn is_tracked(&self, entity: &TrackedEntity) -> bool {
        self.core.entities.lock().contains_key(entity)
    }

    /// Replace a snapshot wholesale with a freshly fetched one, typically in
    /// answer to [`SyncEvent::RefetchRequired`]. Returns `false` if the
    /// entity is no longer tracked.
    pub fn replace_snapshot(&self, entity: &TrackedEntity, fetched: ProgressSnapshot) -> bool {
        let entities = self.core.entities.lock();
        let Some(tracked) = entities.get(entity) else {
            return false;
        };
        tracked.snapshot.send_replace(merge::replace(fetched, Utc::now()));
        self.core.metrics.record_snapshot_update();
        true
    }

    /// Receive connectivity changes, refetch requests and server events
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.core.events.subscribe()
    }

    /// Reset backoff and reconnect the channel carrying `entity`, leaving
    /// `Fallback` if it got there. Returns `false` if the entity is not
    /// tracked.
    pub fn reconnect(&self, entity: &TrackedEntity) -> bool {
        let channels = self.channels.lock();
        if !self.is_tracked(entity) {
            return false;
        }

        let conn = if entity.kind.is_multiplexed() {
            channels.shared.as_ref()
        } else {
            channels.dedicated.get(entity)
        };
        match conn {
            Some(conn) => {
                info!("[{}] Manual reconnect requested", conn.label());
                conn.reconnect();
                true
            }
            None => false,
        }
    }

    /// Tear down every entity and connection. Idempotent.
    pub fn shutdown(&self) {
        let mut channels = self.channels.lock();
        for (_, conn) in channels.dedicated.drain() {
            conn.close();
        }
        if let Some(shared) = channels.shared.take() {
            shared.close();
        }
        self.core.registry.clear();
        let dropped = {
            let mut entities = self.core.entities.lock();
            let count = entities.len();
            entities.clear();
            count
        };
        if dropped > 0 {
            info!("Shut down, dropped {} tracked entities", dropped);
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.core.metrics.clone()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn shared_connection<'a>(
        &self,
        channels: &'a mut Channels<C>,
    ) -> Option<&'a ConnectionManager<C>> {
        if channels.shared.is_none() {
            let url = match self.config.endpoints.multiplexed_url() {
                Ok(url) => url,
                Err(e) => {
                    error!("[{}] Cannot derive channel URL: {}", SHARED_LABEL, e);
                    self.core.shared_state(ConnectionState::Fallback);
                    return None;
                }
            };
            let handler = Arc::new(SharedHandler {
                router: EventRouter::multiplexed(),
                core: self.core.clone(),
            });
            self.core.shared_status.send_replace(ConnectivityStatus::Connecting);

            let conn = ConnectionManager::new(
                SHARED_LABEL,
                url,
                self.connector.clone(),
                self.config.multiplexed.clone(),
                self.config.connect_timeout,
                handler,
                self.core.metrics.clone(),
            );
            conn.open();
            channels.shared = Some(conn);
        }
        channels.shared.as_ref()
    }

    fn open_dedicated(&self, channels: &mut Channels<C>, entity: &TrackedEntity) {
        let url = match self.config.endpoints.url_for(entity) {
            Ok(url) => url,
            Err(e) => {
                error!("Cannot derive channel URL for {}: {}", entity.id, e);
                self.core.entity_state(entity, ConnectionState::Fallback);
                return;
            }
        };

        let label = format!("{:?}:{}", entity.kind, entity.id);
        let handler = Arc::new(DedicatedHandler {
            entity: entity.clone(),
            router: EventRouter::dedicated(entity.kind.wire_format(), entity.id.clone()),
            core: self.core.clone(),
        });
        let conn = ConnectionManager::new(
            label,
            url,
            self.connector.clone(),
            self.config.dedicated.clone(),
            self.config.connect_timeout,
            handler,
            self.core.metrics.clone(),
        );
        conn.open();
        channels.dedicated.insert(entity.clone(), conn);
    }
}
