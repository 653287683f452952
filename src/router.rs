//! Classifies inbound frames and turns recognized events into [`Update`]s
//! for the merger.

use crate::heartbeat::{PING, PONG};
use crate::protocol::{
    AgentUpdateData, ChapterProgressData, ErrorData, JobFailedData, JobProgressData,
    StatusChangeData,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, trace};

/// Shape of the frames a channel carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Shared channel: flat objects addressed by `job_id`
    Multiplexed,
    /// First-generation book channel: `{"event": ..., "data": {...}}`
    Enveloped,
    /// Second-generation book channel: bare `{"agent","message","percentage"}`
    Flat,
}

/// Server acknowledgements that carry no progress
const CONTROL_EVENTS: &[&str] = &["connected", "subscribed", "unsubscribed", "pong"];

/// Recognized events that are forwarded to listeners but never merged
const FORWARDED_EVENTS: &[&str] = &[
    "job_started",
    "stats_update",
    "chunk_translated",
    "batch_completed",
    "batch_exported",
];

/// A classified change to apply to a snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// `status_change`: status, error and a nested progress patch
    Status(StatusChangeData),
    /// One agent reporting on its own work
    AgentProgress {
        agent: Option<String>,
        stage: Option<String>,
        completed: Option<u64>,
        percent: Option<f64>,
    },
    /// `job_progress` / `job_updated` on the shared channel
    Job(JobProgressData),
    /// Content changed; the payload is not enough to merge
    Boundary,
    /// Terminal failure with an optional message
    Failure { message: Option<String> },
}

/// A recognized server event
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedEvent {
    /// Entity the event is about. `None` for channel-wide events such as
    /// `stats_update`.
    pub entity_id: Option<String>,
    pub name: String,
    /// Raw payload, forwarded untouched to listeners
    pub payload: Value,
    /// What the merger should do, if anything
    pub update: Option<Update>,
}

/// Why a frame was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Not JSON, not an object, or a payload of the wrong shape
    Malformed,
    /// Well-formed but names an event this client does not know
    Unknown,
}

/// Result of routing one frame
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Bare `"ping"` / `"pong"` token
    Heartbeat,
    /// Acknowledgement (`connected`, `subscribed`, action echo, ...)
    Control(String),
    Event(RoutedEvent),
    Dropped(DropReason),
}

/// Parses frames for one channel.
///
/// Routing never fails: anything unusable comes back as
/// [`Routed::Dropped`] and leaves the connection alone.
#[derive(Debug, Clone)]
pub struct EventRouter {
    format: WireFormat,
    /// Entity a dedicated channel belongs to
    entity_id: Option<String>,
}

impl EventRouter {
    /// Router for the shared channel
    pub fn multiplexed() -> Self {
        Self {
            format: WireFormat::Multiplexed,
            entity_id: None,
        }
    }

    /// Router for a channel dedicated to one entity
    pub fn dedicated(format: WireFormat, entity_id: impl Into<String>) -> Self {
        Self {
            format,
            entity_id: Some(entity_id.into()),
        }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Classify one text frame
    pub fn route(&self, text: &str) -> Routed {
        let trimmed = text.trim();
        if trimmed == PING || trimmed == PONG {
            trace!("Heartbeat token: {}", trimmed);
            return Routed::Heartbeat;
        }

        let object = match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(object)) => object,
            Ok(_) => return dropped(DropReason::Malformed, "not a JSON object"),
            Err(e) => {
                debug!("Dropping unparseable frame: {}", e);
                return Routed::Dropped(DropReason::Malformed);
            }
        };

        let name = match object.get("event").and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => {
                if let Some(action) = object.get("action").and_then(Value::as_str) {
                    return Routed::Control(action.to_string());
                }
                if self.format == WireFormat::Flat {
                    return self.flat_update(object);
                }
                return dropped(DropReason::Malformed, "no event field");
            }
        };

        if CONTROL_EVENTS.contains(&name.as_str()) {
            return Routed::Control(name);
        }

        let entity_id = match self.format {
            WireFormat::Multiplexed => object
                .get("job_id")
                .and_then(|id| match id {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                }),
            WireFormat::Enveloped | WireFormat::Flat => self.entity_id.clone(),
        };

        let payload = match self.format {
            WireFormat::Multiplexed => Value::Object(object),
            WireFormat::Enveloped | WireFormat::Flat => match object.get("data") {
                Some(data @ Value::Object(_)) => data.clone(),
                Some(Value::Null) | None => Value::Object(Map::new()),
                Some(_) => return dropped(DropReason::Malformed, "data is not an object"),
            },
        };

        let update = match self.classify(&name, &payload) {
            Classified::Merge(update) => Some(update),
            Classified::Forward => None,
            Classified::Unknown => {
                debug!("Dropping unknown event '{}'", name);
                return Routed::Dropped(DropReason::Unknown);
            }
            Classified::Malformed => {
                debug!("Dropping '{}' with malformed payload", name);
                return Routed::Dropped(DropReason::Malformed);
            }
        };

        if update.is_some() && entity_id.is_none() {
            return dropped(DropReason::Malformed, "progress event without job_id");
        }

        Routed::Event(RoutedEvent {
            entity_id,
            name,
            payload,
            update,
        })
    }

    fn classify(&self, name: &str, payload: &Value) -> Classified {
        match name {
            "status_change" => parse(payload, Update::Status),
            "chapter_progress" | "agent_progress" => {
                parse(payload, |data: ChapterProgressData| Update::AgentProgress {
                    agent: data.agent,
                    stage: data.chapter.as_ref().and_then(chapter_label),
                    completed: data.chapters_done,
                    percent: None,
                })
            }
            "chapter_complete" | "pipeline_complete" | "job_completed" => {
                Classified::Merge(Update::Boundary)
            }
            "error" => parse(payload, |data: ErrorData| Update::Failure {
                message: data.message,
            }),
            "job_failed" => parse(payload, |data: JobFailedData| Update::Failure {
                message: data.error,
            }),
            "job_progress" | "job_updated" => parse(payload, Update::Job),
            name if FORWARDED_EVENTS.contains(&name) => Classified::Forward,
            _ => Classified::Unknown,
        }
    }

    /// Second-generation frames have no event name at all
    fn flat_update(&self, object: Map<String, Value>) -> Routed {
        let payload = Value::Object(object);
        let data: AgentUpdateData = match serde_json::from_value(payload.clone()) {
            Ok(data) => data,
            Err(e) => {
                debug!("Dropping malformed agent update: {}", e);
                return Routed::Dropped(DropReason::Malformed);
            }
        };
        if data.agent.is_none() && data.message.is_none() && data.percentage.is_none() {
            return dropped(DropReason::Malformed, "empty agent update");
        }

        Routed::Event(RoutedEvent {
            entity_id: self.entity_id.clone(),
            name: "agent_update".to_string(),
            payload,
            update: Some(Update::AgentProgress {
                agent: data.agent,
                stage: data.message,
                completed: None,
                percent: data.percentage,
            }),
        })
    }
}

enum Classified {
    Merge(Update),
    Forward,
    Unknown,
    Malformed,
}

fn parse<T: DeserializeOwned>(payload: &Value, build: impl FnOnce(T) -> Update) -> Classified {
    match T::deserialize(payload) {
        Ok(data) => Classified::Merge(build(data)),
        Err(_) => Classified::Malformed,
    }
}

fn chapter_label(chapter: &Value) -> Option<String> {
    match chapter {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(format!("chapter {}", n)),
        _ => None,
    }
}

fn dropped(reason: DropReason, why: &str) -> Routed {
    debug!("Dropping frame: {}", why);
    Routed::Dropped(reason)
}
