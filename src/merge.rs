//! Snapshot merging.
//!
//! [`merge`] is a pure function from (previous snapshot, update) to either a
//! new snapshot or a request to refetch. It never touches fields the update
//! does not address, and it never panics on partial payloads.

use crate::router::Update;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Status written by a failure event
pub const FAILED_STATUS: &str = "failed";

/// Error text used when a failure event carries no message
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// Status of an entity nothing has been heard about yet
pub const PENDING_STATUS: &str = "pending";

/// Cached aggregate progress for one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub status: String,
    /// 0 to 100, never decreasing between refetches
    pub progress_percent: f64,
    pub stage_label: Option<String>,
    pub current_agent: Option<String>,
    /// Work counter per agent
    pub per_stage_counters: BTreeMap<String, u64>,
    pub error: Option<String>,
    pub last_updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// Empty snapshot for an entity that was just tracked
    pub fn pending(now: DateTime<Utc>) -> Self {
        Self {
            status: PENDING_STATUS.to_string(),
            progress_percent: 0.0,
            stage_label: None,
            current_agent: None,
            per_stage_counters: BTreeMap::new(),
            error: None,
            last_updated_at: now,
        }
    }

    /// Whether the last failure event marked this entity as failed
    pub fn is_failed(&self) -> bool {
        self.status == FAILED_STATUS
    }
}

/// What applying an update produced
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Updated(ProgressSnapshot),
    /// Content changed beyond what the event carries; fetch the entity
    /// and [`replace`] the snapshot
    RefetchRequired,
}

/// Apply `update` to `prev`, returning the next snapshot.
pub fn merge(prev: &ProgressSnapshot, update: &Update, now: DateTime<Utc>) -> MergeOutcome {
    let mut next = prev.clone();

    match update {
        Update::Boundary => return MergeOutcome::RefetchRequired,

        Update::Status(data) => {
            overwrite(&mut next.status, &data.status);
            if let Some(error) = &data.error {
                next.error = Some(error.clone());
            }
            if let Some(patch) = &data.progress {
                raise_percent(&mut next, patch.progress);
                overwrite_opt(&mut next.stage_label, &patch.stage);
                overwrite_opt(&mut next.current_agent, &patch.current_agent);
                if let Some(counters) = &patch.counters {
                    for (agent, value) in counters {
                        next.per_stage_counters.insert(agent.clone(), *value);
                    }
                }
            }
        }

        Update::AgentProgress {
            agent,
            stage,
            completed,
            percent,
        } => {
            overwrite_opt(&mut next.current_agent, agent);
            overwrite_opt(&mut next.stage_label, stage);
            // Only the reporting agent's slot; other agents' counters stay put
            if let (Some(agent), Some(completed)) = (agent, completed) {
                next.per_stage_counters.insert(agent.clone(), *completed);
            }
            raise_percent(&mut next, *percent);
        }

        Update::Job(data) => {
            overwrite(&mut next.status, &data.status);
            overwrite_opt(&mut next.stage_label, &data.stage);
            raise_percent(&mut next, data.progress);
        }

        Update::Failure { message } => {
            next.status = FAILED_STATUS.to_string();
            next.error = Some(
                message
                    .clone()
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| UNKNOWN_ERROR.to_string()),
            );
            next.last_updated_at = now;
            return MergeOutcome::Updated(next);
        }
    }

    if next.progress_percent >= 100.0 && prev.progress_percent < 100.0 {
        return MergeOutcome::RefetchRequired;
    }

    next.last_updated_at = now;
    MergeOutcome::Updated(next)
}

/// Wholesale replacement with a freshly fetched snapshot
pub fn replace(mut fetched: ProgressSnapshot, now: DateTime<Utc>) -> ProgressSnapshot {
    fetched.progress_percent = clamp_percent(fetched.progress_percent).unwrap_or(0.0);
    fetched.last_updated_at = now;
    fetched
}

fn overwrite(field: &mut String, value: &Option<String>) {
    if let Some(value) = value {
        field.clone_from(value);
    }
}

fn overwrite_opt(field: &mut Option<String>, value: &Option<String>) {
    if value.is_some() {
        field.clone_from(value);
    }
}

fn raise_percent(snapshot: &mut ProgressSnapshot, reported: Option<f64>) {
    if let Some(percent) = reported.and_then(clamp_percent) {
        snapshot.progress_percent = snapshot.progress_percent.max(percent);
    }
}

fn clamp_percent(value: f64) -> Option<f64> {
    if value.is_nan() {
        None
    } else {
        Some(value.clamp(0.0, 100.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JobProgressData, ProgressPatch, StatusChangeData};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn with_counters(counters: &[(&str, u64)]) -> ProgressSnapshot {
        let mut snapshot = ProgressSnapshot::pending(at(0));
        snapshot.status = "running".into();
        snapshot.progress_percent = 30.0;
        for (agent, value) in counters {
            snapshot.per_stage_counters.insert(agent.to_string(), *value);
        }
        snapshot
    }

    fn agent(name: &str, completed: u64) -> Update {
        Update::AgentProgress {
            agent: Some(name.into()),
            stage: None,
            completed: Some(completed),
            percent: None,
        }
    }

    fn updated(outcome: MergeOutcome) -> ProgressSnapshot {
        match outcome {
            MergeOutcome::Updated(snapshot) => snapshot,
            MergeOutcome::RefetchRequired => panic!("unexpected refetch"),
        }
    }

    #[test]
    fn test_agent_update_touches_only_its_counter() {
        let prev = with_counters(&[("writer", 3), ("enricher", 1)]);
        let next = updated(merge(&prev, &agent("enricher", 2), at(5)));

        assert_eq!(next.per_stage_counters.get("writer"), Some(&3));
        assert_eq!(next.per_stage_counters.get("enricher"), Some(&2));
        assert_eq!(next.current_agent.as_deref(), Some("enricher"));
        assert_eq!(next.status, "running");
        assert_eq!(next.last_updated_at, at(5));
        // Previous snapshot untouched
        assert_eq!(prev.per_stage_counters.get("enricher"), Some(&1));
    }

    #[test]
    fn test_interleaved_agents_commute() {
        let prev = with_counters(&[("editor", 7)]);
        let a = agent("writer", 4);
        let b = agent("enricher", 2);

        let ab = updated(merge(&updated(merge(&prev, &a, at(1))), &b, at(2)));
        let ba = updated(merge(&updated(merge(&prev, &b, at(1))), &a, at(2)));

        assert_eq!(ab.per_stage_counters, ba.per_stage_counters);
        assert_eq!(ab.per_stage_counters.get("editor"), Some(&7));
        assert_eq!(ab.progress_percent, ba.progress_percent);
    }

    #[test]
    fn test_boundary_requests_refetch() {
        let prev = with_counters(&[("writer", 3)]);
        assert_eq!(merge(&prev, &Update::Boundary, at(1)), MergeOutcome::RefetchRequired);
        assert_eq!(prev.per_stage_counters.get("writer"), Some(&3));
    }

    #[test]
    fn test_reaching_full_progress_requests_refetch() {
        let prev = with_counters(&[]);
        let update = Update::Job(JobProgressData {
            progress: Some(100.0),
            stage: None,
            status: Some("completed".into()),
        });
        assert_eq!(merge(&prev, &update, at(1)), MergeOutcome::RefetchRequired);
    }

    #[test]
    fn test_status_change_keeps_unaddressed_fields() {
        let mut prev = with_counters(&[("writer", 3)]);
        prev.error = Some("transient".into());
        prev.stage_label = Some("outline".into());

        let update = Update::Status(StatusChangeData {
            status: Some("writing".into()),
            error: None,
            progress: Some(ProgressPatch {
                progress: Some(45.0),
                current_agent: Some("writer".into()),
                ..Default::default()
            }),
        });
        let next = updated(merge(&prev, &update, at(1)));

        assert_eq!(next.status, "writing");
        assert_eq!(next.error.as_deref(), Some("transient"));
        assert_eq!(next.stage_label.as_deref(), Some("outline"));
        assert_eq!(next.current_agent.as_deref(), Some("writer"));
        assert_eq!(next.progress_percent, 45.0);
        assert_eq!(next.per_stage_counters.get("writer"), Some(&3));
    }

    #[test]
    fn test_progress_never_decreases() {
        let prev = with_counters(&[]);
        let update = Update::Job(JobProgressData {
            progress: Some(10.0),
            ..Default::default()
        });
        assert_eq!(updated(merge(&prev, &update, at(1))).progress_percent, 30.0);

        let update = Update::Job(JobProgressData {
            progress: Some(f64::NAN),
            ..Default::default()
        });
        assert_eq!(updated(merge(&prev, &update, at(1))).progress_percent, 30.0);
    }

    #[test]
    fn test_failure_sets_terminal_status() {
        let prev = with_counters(&[("writer", 3)]);

        let next = updated(merge(&prev, &Update::Failure { message: Some("quota".into()) }, at(1)));
        assert!(next.is_failed());
        assert_eq!(next.error.as_deref(), Some("quota"));
        assert_eq!(next.progress_percent, 30.0);

        let next = updated(merge(&prev, &Update::Failure { message: None }, at(1)));
        assert_eq!(next.error.as_deref(), Some(UNKNOWN_ERROR));
    }

    #[test]
    fn test_replace_clamps_and_stamps() {
        let mut fetched = with_counters(&[("writer", 10)]);
        fetched.progress_percent = 140.0;
        let replaced = replace(fetched, at(9));
        assert_eq!(replaced.progress_percent, 100.0);
        assert_eq!(replaced.last_updated_at, at(9));
    }
}
