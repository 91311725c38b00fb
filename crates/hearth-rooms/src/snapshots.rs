//! Delta encoding and an in-process cache of materialised state snapshots.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use hearth_common::StateMap;
use hearth_db::{SnapshotId, StateSnapshot};

/// Encode `state` relative to `base`.
///
/// Falls back to a full snapshot when there is no base, when the delta chain
/// would grow past `max_chain`, or when `state` drops a key the base has
/// (deltas can only add or replace).
pub fn encode(
    room_id: &str,
    base: Option<(SnapshotId, &StateMap, u32)>,
    state: &StateMap,
    max_chain: u32,
) -> StateSnapshot {
    let Some((base_id, base_state, base_chain)) = base else {
        return StateSnapshot::full(room_id, state.clone());
    };
    if base_chain + 1 > max_chain || base_state.keys().any(|k| !state.contains_key(k)) {
        return StateSnapshot::full(room_id, state.clone());
    }
    let delta = state
        .iter()
        .filter(|(k, id)| base_state.get(*k) != Some(*id))
        .map(|(k, id)| (k.clone(), id.clone()))
        .collect();
    StateSnapshot { room_id: room_id.to_owned(), base: Some(base_id), chain_len: base_chain + 1, delta }
}

struct Entry {
    state: Arc<StateMap>,
    chain_len: u32,
}

/// FIFO-evicting cache of full states by snapshot id.
pub struct SnapshotCache {
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    entries: HashMap<SnapshotId, Entry>,
    order: VecDeque<SnapshotId>,
    capacity: usize,
}

impl SnapshotCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn get(&self, id: &SnapshotId) -> Option<(Arc<StateMap>, u32)> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.get(id).map(|e| (e.state.clone(), e.chain_len))
    }

    pub fn insert(&self, id: SnapshotId, state: Arc<StateMap>, chain_len: u32) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.entries.insert(id, Entry { state, chain_len }).is_some() {
            return;
        }
        inner.order.push_back(id);
        while inner.order.len() > inner.capacity {
            if let Some(old) = inner.order.pop_front() {
                inner.entries.remove(&old);
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.clear();
        inner.order.clear();
    }
}
