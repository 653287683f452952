use crate::connection::ConnectionManager;
use crate::protocol::ClientMessage;
use crate::transport::Connector;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, error, trace};

/// Where subscription messages go.
///
/// Implemented by [`ConnectionManager`]; tests plug in a recorder.
pub trait Outbound {
    fn is_open(&self) -> bool;

    /// Best-effort send; `false` if the frame was dropped
    fn send_text(&self, text: String) -> bool;
}

impl<C: Connector> Outbound for ConnectionManager<C> {
    fn is_open(&self) -> bool {
        ConnectionManager::is_open(self)
    }

    fn send_text(&self, text: String) -> bool {
        self.send(text)
    }
}

/// Reference-counted interest in entities on the shared channel.
///
/// Each mutation runs to completion under one lock, sends included, so a
/// re-announcement built on reconnect always sees a consistent table.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<String, usize>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one more observer of `entity_id`.
    ///
    /// The first observer sends `subscribe` if the channel is open; if it is
    /// not, the subscription goes out with the next
    /// [`announcements`](Self::announcements). Returns the new count.
    pub fn acquire(&self, entity_id: &str, outbound: &dyn Outbound) -> usize {
        let mut entries = self.entries.lock();
        let count = entries.entry(entity_id.to_string()).or_insert(0);
        *count += 1;
        let count = *count;

        if count == 1 {
            if outbound.is_open() {
                send(outbound, ClientMessage::Subscribe { job_id: entity_id });
            } else {
                trace!("Channel not open, deferring subscribe for {}", entity_id);
            }
        }
        count
    }

    /// Drop one observer of `entity_id`.
    ///
    /// At zero the entry is removed and `unsubscribe` is sent if the channel
    /// is open. Returns the remaining count, or `None` if the entity was not
    /// registered.
    pub fn release(&self, entity_id: &str, outbound: &dyn Outbound) -> Option<usize> {
        let mut entries = self.entries.lock();
        let count = entries.get_mut(entity_id)?;
        *count = count.saturating_sub(1);
        let count = *count;

        if count == 0 {
            entries.remove(entity_id);
            if outbound.is_open() {
                send(outbound, ClientMessage::Unsubscribe { job_id: entity_id });
            }
        }
        Some(count)
    }

    /// Subscribe frames for every registered entity, sent on each open
    pub fn announcements(&self) -> Vec<String> {
        let entries = self.entries.lock();
        let mut ids: Vec<&String> = entries.keys().collect();
        ids.sort();

        let frames: Vec<String> = ids
            .into_iter()
            .filter_map(|id| encode(ClientMessage::Subscribe { job_id: id }))
            .collect();
        debug!("Re-announcing {} subscriptions", frames.len());
        frames
    }

    /// Forget every subscription without sending anything
    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn ref_count(&self, entity_id: &str) -> usize {
        self.entries.lock().get(entity_id).copied().unwrap_or(0)
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.entries.lock().contains_key(entity_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn encode(message: ClientMessage<'_>) -> Option<String> {
    match message.to_text() {
        Ok(text) => Some(text),
        Err(e) => {
            error!("Failed to encode {:?}: {}", message, e);
            None
        }
    }
}

fn send(outbound: &dyn Outbound, message: ClientMessage<'_>) {
    if let Some(text) = encode(message) {
        if !outbound.send_text(text) {
            debug!("Dropped {:?}; the next open re-announces", message);
        }
    }
}
