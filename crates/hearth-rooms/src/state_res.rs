//! State resolution.
//!
//! Merges the room states of several DAG branches into one. Every server that
//! sees the same branches must compute the same result, so only ordered
//! containers are used and the ordering of conflicted events is an explicit
//! sort key.
//!
//! 1. Split state keys into unconflicted (same event on every branch) and
//!    conflicted.
//! 2. Load the full auth chain of each conflicted event.
//! 3. Sort conflicted events by descending auth power, ascending origin
//!    timestamp, ascending event id.
//! 4. Starting from the unconflicted state, re-authorise each conflicted event
//!    against the partial state built so far. Events that fail are left out.
//! 5. Put the unconflicted state back on top.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use hearth_common::{
    StateEvents, StateKey, StateMap,
    event::{Event, kinds},
};
use tracing::debug;

use crate::{
    auth::{auth_types_for, check_rules},
    power_levels::{PowerLevels, creator_of},
    room_version::RoomVersion,
};

/// Every event the resolver may need, by id.
pub type EventMap = BTreeMap<String, Arc<Event>>;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("event '{0}' needed for state resolution is not available")]
    MissingEvent(String),
}

/// Result of step 1.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Partition {
    pub unconflicted: StateMap,
    pub conflicted: BTreeMap<StateKey, BTreeSet<String>>,
}

impl Partition {
    pub fn of(states: &[StateMap]) -> Self {
        let keys: BTreeSet<&StateKey> = states.iter().flat_map(|s| s.keys()).collect();
        let mut partition = Self::default();
        for key in keys {
            let values: BTreeSet<&String> = states.iter().filter_map(|s| s.get(key)).collect();
            let on_every_branch = states.iter().all(|s| s.contains_key(key));
            match (values.len(), on_every_branch) {
                (1, true) => {
                    if let Some(id) = values.into_iter().next() {
                        partition.unconflicted.insert(key.clone(), id.clone());
                    }
                }
                _ => {
                    partition
                        .conflicted
                        .insert(key.clone(), values.into_iter().cloned().collect());
                }
            }
        }
        partition
    }

    pub fn conflicted_ids(&self) -> BTreeSet<String> {
        self.conflicted.values().flatten().cloned().collect()
    }
}

pub struct StateResolver;

impl StateResolver {
    /// Resolve `states` into one state map.
    ///
    /// `events` must hold every event referenced by `states` and the auth
    /// chains of the conflicted ones.
    pub fn resolve(
        version: &RoomVersion,
        states: &[StateMap],
        events: &EventMap,
    ) -> Result<StateMap, ResolveError> {
        let partition = Partition::of(states);
        if partition.conflicted.is_empty() {
            return Ok(partition.unconflicted);
        }

        let get = |id: &str| events.get(id).cloned().ok_or_else(|| ResolveError::MissingEvent(id.to_owned()));

        let mut ordered = Vec::new();
        for id in partition.conflicted_ids() {
            let event = get(&id)?;
            let chain = auth_chain(&event, events)?;
            let power = version.auth_power.power(&event, sender_level(&event, &chain));
            ordered.push((Reverse(power), event.origin_server_ts, id, event));
        }
        ordered.sort_by(|a, b| (a.0, a.1, &a.2).cmp(&(b.0, b.1, &b.2)));

        let mut resolved = partition.unconflicted.clone();
        for (_, _, id, event) in ordered {
            let Some(slot) = event.state_slot() else { continue };
            let auth_state = partial_auth_state(&event, &resolved, events)?;
            if check_rules(&event, &auth_state, version).is_allowed() {
                resolved.insert(slot, id);
            } else {
                debug!(event_id = %id, "Conflicted event failed re-authorisation");
            }
        }

        resolved.extend(partition.unconflicted);
        Ok(resolved)
    }
}

/// Transitive closure of `auth_events`, the event itself excluded.
pub fn auth_chain(event: &Event, events: &EventMap) -> Result<BTreeMap<String, Arc<Event>>, ResolveError> {
    let mut chain = BTreeMap::new();
    let mut todo: Vec<&String> = event.auth_events.iter().collect();
    while let Some(id) = todo.pop() {
        if chain.contains_key(id) {
            continue;
        }
        let ev = events.get(id).ok_or_else(|| ResolveError::MissingEvent(id.clone()))?;
        todo.extend(ev.auth_events.iter());
        chain.insert(id.clone(), ev.clone());
    }
    Ok(chain)
}

/// The sender's level according to the newest power-levels event in the
/// auth chain, ordered by (depth, ts, id).
fn sender_level(event: &Event, chain: &BTreeMap<String, Arc<Event>>) -> i64 {
    let newest_pl = chain
        .values()
        .filter(|ev| ev.is_type(kinds::POWER_LEVELS) && ev.state_key.as_deref() == Some(""))
        .max_by(|a, b| (a.depth, a.origin_server_ts, &a.event_id).cmp(&(b.depth, b.origin_server_ts, &b.event_id)));

    let levels = newest_pl.and_then(|pl| PowerLevels::from_content(&pl.content).ok()).unwrap_or_else(|| {
        let create = if event.is_create() { Some(event) } else { chain.values().map(Arc::as_ref).find(|ev| ev.is_create()) };
        PowerLevels::fallback(create.map(creator_of))
    });
    levels.user_level(&event.sender)
}

/// Auth state for re-checking `event`: the partial resolved state, with the
/// event's own auth events filling slots the partial state lacks.
fn partial_auth_state(event: &Event, partial: &StateMap, events: &EventMap) -> Result<StateEvents, ResolveError> {
    let mut own: BTreeMap<StateKey, &String> = BTreeMap::new();
    for id in &event.auth_events {
        let ev = events.get(id).ok_or_else(|| ResolveError::MissingEvent(id.clone()))?;
        if let Some(slot) = ev.state_slot() {
            own.insert(slot, id);
        }
    }

    let mut state = StateEvents::new();
    for key in auth_types_for(event) {
        let Some(id) = partial.get(&key).or_else(|| own.get(&key).copied()) else { continue };
        let ev = events.get(id).ok_or_else(|| ResolveError::MissingEvent(id.clone()))?;
        state.insert(key, ev.clone());
    }
    Ok(state)
}
