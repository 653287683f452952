//! Wire types for both channel families.
//!
//! Multiplexed channel (one shared connection for translation jobs):
//!
//! ```text
//! client -> {"action":"subscribe","job_id":"<id>"}
//! client -> {"action":"unsubscribe","job_id":"<id>"}
//! server -> {"event":"job_progress","job_id":"<id>","progress":40,"stage":"...","status":"..."}
//! server -> {"event":"connected"} | {"event":"subscribed","job_id":"<id>"} | {"event":"pong"}
//! ```
//!
//! Dedicated channels (one connection per book pipeline) exchange plain
//! `"ping"`/`"pong"` text and `{"event": ..., "data": {...}}` envelopes.
//! Second-generation pipelines send a flat `{"agent","message","percentage"}`
//! object with no envelope.
//!
//! Every payload field is optional: a missing field means "not addressed
//! by this event", never "cleared".

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Client-to-server control messages on the multiplexed channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage<'a> {
    Subscribe { job_id: &'a str },
    Unsubscribe { job_id: &'a str },
}

impl ClientMessage<'_> {
    /// Encode as a JSON text frame
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Payload of `status_change`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StatusChangeData {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub progress: Option<ProgressPatch>,
}

/// Nested progress object inside `status_change`, merged key by key
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProgressPatch {
    #[serde(default, alias = "percent", alias = "percentage")]
    pub progress: Option<f64>,
    #[serde(default, alias = "stage_label", alias = "current_stage")]
    pub stage: Option<String>,
    #[serde(default, alias = "agent")]
    pub current_agent: Option<String>,
    #[serde(default, alias = "per_stage")]
    pub counters: Option<BTreeMap<String, u64>>,
}

/// Payload of `chapter_progress`: one agent reporting its own count
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChapterProgressData {
    #[serde(default)]
    pub agent: Option<String>,
    /// Chapter number or title currently being worked on
    #[serde(default)]
    pub chapter: Option<Value>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub chapters_done: Option<u64>,
}

/// Payload of `error`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ErrorData {
    #[serde(default, alias = "error")]
    pub message: Option<String>,
}

/// Flat second-generation pipeline update
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AgentUpdateData {
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub percentage: Option<f64>,
}

/// Fields of `job_progress` / `job_updated` on the multiplexed channel
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JobProgressData {
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Fields of `job_failed`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JobFailedData {
    #[serde(default, alias = "message")]
    pub error: Option<String>,
}
