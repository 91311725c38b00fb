//! Per-room exclusion.
//!
//! Accepting an event reads and rewrites a room's extremities and snapshot
//! index, so submissions to one room are serialised. Rooms never share a
//! mutex: the table is sharded by room id only to keep the map locks short,
//! and a room's mutex is dropped from its shard once nobody holds it.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{Mutex as RoomMutex, OwnedMutexGuard};

pub type RoomGuard = OwnedMutexGuard<()>;

type Shard = Mutex<HashMap<String, Weak<RoomMutex<()>>>>;

pub struct RoomLocks {
    shards: Vec<Shard>,
}

impl RoomLocks {
    pub fn new(shards: usize) -> Self {
        Self { shards: (0..shards.max(1)).map(|_| Mutex::new(HashMap::new())).collect() }
    }

    fn shard(&self, room_id: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        room_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Wait for exclusive access to `room_id`.
    pub async fn lock(&self, room_id: &str) -> RoomGuard {
        let mutex = {
            let mut shard = self.shard(room_id).lock().unwrap_or_else(PoisonError::into_inner);
            match shard.get(room_id).and_then(Weak::upgrade) {
                Some(mutex) => mutex,
                None => {
                    shard.retain(|_, weak| weak.strong_count() > 0);
                    let mutex = Arc::new(RoomMutex::new(()));
                    shard.insert(room_id.to_owned(), Arc::downgrade(&mutex));
                    mutex
                }
            }
        };
        mutex.lock_owned().await
    }

    /// Rooms with a live mutex.
    pub fn active(&self) -> usize {
        self.shards
            .iter()
            .map(|s| {
                let shard = s.lock().unwrap_or_else(PoisonError::into_inner);
                shard.values().filter(|w| w.strong_count() > 0).count()
            })
            .sum()
    }
}
