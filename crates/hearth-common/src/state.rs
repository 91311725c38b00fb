//! Room state types.
//!
//! Room state maps `(event type, state key)` to a single state event. Only
//! ordered containers are used so that iteration order is identical on every
//! server.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// `(event type, state key)` pair addressing one slot of room state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateKey {
    pub event_type: String,
    pub state_key: String,
}

impl StateKey {
    pub fn new(event_type: impl Into<String>, state_key: impl Into<String>) -> Self {
        Self { event_type: event_type.into(), state_key: state_key.into() }
    }
}

/// Resolved state by identifier.
pub type StateMap = BTreeMap<StateKey, String>;

/// Resolved state with the events loaded.
pub type StateEvents = BTreeMap<StateKey, Arc<Event>>;

/// One flattened state entry: the persisted shape of a [`StateMap`], since
/// JSON objects cannot be keyed by a pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    #[serde(rename = "type")]
    pub event_type: String,
    pub state_key: String,
    pub event_id: String,
}

pub fn to_entries(map: &StateMap) -> Vec<StateEntry> {
    map.iter()
        .map(|(k, id)| StateEntry {
            event_type: k.event_type.clone(),
            state_key: k.state_key.clone(),
            event_id: id.clone(),
        })
        .collect()
}

pub fn from_entries(entries: Vec<StateEntry>) -> StateMap {
    entries
        .into_iter()
        .map(|e| (StateKey::new(e.event_type, e.state_key), e.event_id))
        .collect()
}

/// Serde adapter for `StateMap` fields.
pub mod serde_state_map {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::{StateEntry, StateMap, from_entries, to_entries};

    pub fn serialize<S: Serializer>(map: &StateMap, s: S) -> Result<S::Ok, S::Error> {
        to_entries(map).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<StateMap, D::Error> {
        Ok(from_entries(Vec::<StateEntry>::deserialize(d)?))
    }
}
