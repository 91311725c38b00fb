//! Outliers indexed by the prev events they are waiting for.
//!
//! Accepting an event only retries the outliers that cite it. Each room holds
//! at most `capacity` outliers; past that the oldest is evicted and the DAG
//! forgets it.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct RoomOutliers {
    /// Oldest first.
    order: VecDeque<String>,
    /// Outlier id to the prev events it lacks.
    missing: HashMap<String, Vec<String>>,
}

#[derive(Default)]
struct Inner {
    rooms: HashMap<String, RoomOutliers>,
    /// Missing prev event to the outliers citing it.
    waiting: HashMap<String, BTreeSet<String>>,
    /// Rooms whose stored outliers have been registered since start.
    loaded: HashSet<String>,
}

pub struct OutlierIndex {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl OutlierIndex {
    pub fn new(capacity: usize) -> Self {
        Self { inner: Mutex::new(Inner::default()), capacity: capacity.max(1) }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_loaded(&self, room_id: &str) -> bool {
        self.lock().loaded.contains(room_id)
    }

    pub fn mark_loaded(&self, room_id: &str) {
        self.lock().loaded.insert(room_id.to_owned());
    }

    /// Track `outlier` as waiting for `missing`, replacing what it was
    /// waiting for before. Returns the outliers evicted to stay in capacity.
    pub fn insert(&self, room_id: &str, outlier: &str, missing: &[String]) -> Vec<String> {
        let mut inner = self.lock();
        let Inner { rooms, waiting, .. } = &mut *inner;
        let room = rooms.entry(room_id.to_owned()).or_default();

        match room.missing.insert(outlier.to_owned(), missing.to_vec()) {
            Some(previous) => unlink(waiting, outlier, &previous),
            None => room.order.push_back(outlier.to_owned()),
        }
        for prev in missing {
            waiting.entry(prev.clone()).or_default().insert(outlier.to_owned());
        }

        let mut evicted = Vec::new();
        while room.order.len() > self.capacity {
            let Some(oldest) = room.order.pop_front() else { break };
            if let Some(prevs) = room.missing.remove(&oldest) {
                unlink(waiting, &oldest, &prevs);
            }
            evicted.push(oldest);
        }
        evicted
    }

    /// Outliers that cited `event_id` as missing. The link is consumed; the
    /// outliers stay tracked until [`OutlierIndex::remove`].
    pub fn take_waiting(&self, event_id: &str) -> Vec<String> {
        self.lock().waiting.remove(event_id).map(|s| s.into_iter().collect()).unwrap_or_default()
    }

    pub fn remove(&self, room_id: &str, outlier: &str) {
        let mut inner = self.lock();
        let Inner { rooms, waiting, .. } = &mut *inner;
        let Some(room) = rooms.get_mut(room_id) else { return };
        if let Some(prevs) = room.missing.remove(outlier) {
            room.order.retain(|id| id != outlier);
            unlink(waiting, outlier, &prevs);
        }
    }

    /// Drop everything known about `room_id` so it is reloaded from the store.
    pub fn forget_room(&self, room_id: &str) {
        let mut inner = self.lock();
        let Inner { rooms, waiting, loaded } = &mut *inner;
        loaded.remove(room_id);
        if let Some(room) = rooms.remove(room_id) {
            for (outlier, prevs) in room.missing {
                unlink(waiting, &outlier, &prevs);
            }
        }
    }

    pub fn len(&self, room_id: &str) -> usize {
        self.lock().rooms.get(room_id).map_or(0, |r| r.order.len())
    }
}

fn unlink(waiting: &mut HashMap<String, BTreeSet<String>>, outlier: &str, prevs: &[String]) {
    for prev in prevs {
        if let Some(set) = waiting.get_mut(prev) {
            set.remove(outlier);
            if set.is_empty() {
                waiting.remove(prev);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn outliers_are_found_by_the_prev_they_lack() {
        let index = OutlierIndex::new(10);
        index.insert("!r", "$o1", &ids(&["$p1", "$p2"]));
        index.insert("!r", "$o2", &ids(&["$p1"]));

        assert_eq!(index.take_waiting("$p1"), ids(&["$o1", "$o2"]));
        assert!(index.take_waiting("$p1").is_empty());
        assert_eq!(index.take_waiting("$p2"), ids(&["$o1"]));
        assert!(index.take_waiting("$unrelated").is_empty());
        assert_eq!(index.len("!r"), 2);
    }

    #[test]
    fn oldest_outlier_is_evicted_past_capacity() {
        let index = OutlierIndex::new(2);
        assert!(index.insert("!r", "$o1", &ids(&["$p1"])).is_empty());
        assert!(index.insert("!r", "$o2", &ids(&["$p2"])).is_empty());
        assert!(index.insert("!other", "$x", &ids(&["$p9"])).is_empty());

        assert_eq!(index.insert("!r", "$o3", &ids(&["$p3"])), ids(&["$o1"]));
        assert!(index.take_waiting("$p1").is_empty());
        assert_eq!(index.len("!r"), 2);
        assert_eq!(index.len("!other"), 1);
    }

    #[test]
    fn reinserting_replaces_the_missing_set() {
        let index = OutlierIndex::new(2);
        index.insert("!r", "$o1", &ids(&["$p1"]));
        assert!(index.insert("!r", "$o1", &ids(&["$p2"])).is_empty());

        assert!(index.take_waiting("$p1").is_empty());
        assert_eq!(index.take_waiting("$p2"), ids(&["$o1"]));
        assert_eq!(index.len("!r"), 1);
    }

    #[test]
    fn removed_and_forgotten_outliers_are_unlinked() {
        let index = OutlierIndex::new(10);
        index.insert("!r", "$o1", &ids(&["$p1"]));
        index.insert("!r", "$o2", &ids(&["$p2"]));
        index.mark_loaded("!r");

        index.remove("!r", "$o1");
        assert!(index.take_waiting("$p1").is_empty());
        assert_eq!(index.len("!r"), 1);

        index.forget_room("!r");
        assert!(!index.is_loaded("!r"));
        assert!(index.take_waiting("$p2").is_empty());
        assert_eq!(index.len("!r"), 0);
    }
}
