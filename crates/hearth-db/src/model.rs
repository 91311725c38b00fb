//! Stored record shapes.

use std::sync::Arc;

use hearth_common::{Event, StateMap, state::serde_state_map};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State snapshots are addressed by time-ordered UUID v7.
pub type SnapshotId = Uuid;

/// Result of a successful `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// Identical bytes were already stored.
    AlreadyPresent,
}

/// An event with its insertion position in the room's sequence.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub position: i64,
    pub event: Arc<Event>,
}

/// Lifecycle of an event on this server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum EventStatus {
    /// Referenced or received, but its prev events are not known yet.
    Outlier,
    Accepted,
    /// Kept in the DAG, excluded from state.
    Rejected(String),
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outlier => "outlier",
            Self::Accepted => "accepted",
            Self::Rejected(_) => "rejected",
        }
    }

    pub fn is_outlier(&self) -> bool {
        matches!(self, Self::Outlier)
    }
}

/// Per-event bookkeeping owned by the DAG manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMeta {
    pub room_id: String,
    pub status: EventStatus,
    pub state_before: Option<SnapshotId>,
    pub state_after: Option<SnapshotId>,
}

impl EventMeta {
    pub fn outlier(room_id: impl Into<String>) -> Self {
        Self { room_id: room_id.into(), status: EventStatus::Outlier, state_before: None, state_after: None }
    }
}

/// A delta-encoded state snapshot.
///
/// Full state = full state of `base` overlaid with `delta`. `chain_len` counts
/// the deltas between this snapshot and the nearest full one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub room_id: String,
    pub base: Option<SnapshotId>,
    pub chain_len: u32,
    #[serde(with = "serde_state_map")]
    pub delta: StateMap,
}

impl StateSnapshot {
    pub fn full(room_id: impl Into<String>, state: StateMap) -> Self {
        Self { room_id: room_id.into(), base: None, chain_len: 0, delta: state }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub room_id: String,
    pub room_version: String,
    pub create_event_id: String,
}
