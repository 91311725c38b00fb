//! In-memory backend for both stores.
//!
//! Not durable: used by tests and `--ephemeral` runs. Semantics match the
//! PostgreSQL backend, including byte-level duplicate detection.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use hearth_common::Event;
use tokio::sync::RwLock;

use crate::{
    error::{StoreError, StoreResult},
    event_store::{EventStore, EventStream, ROOM_PAGE_SIZE, paged},
    model::{EventMeta, PutOutcome, RoomRecord, SnapshotId, StateSnapshot, StoredEvent},
    outbound_store::OutboundStore,
    state_store::StateStore,
};

struct StoredBytes {
    position: i64,
    canonical: String,
    event: Arc<Event>,
}

#[derive(Default)]
struct Inner {
    events: HashMap<String, StoredBytes>,
    /// room_id → [(position, event_id)] in insertion order.
    by_room: HashMap<String, Vec<(i64, String)>>,
    next_position: i64,
    /// event_id → (first-write sequence, meta)
    meta: HashMap<String, (u64, EventMeta)>,
    next_meta_seq: u64,
    snapshots: HashMap<SnapshotId, StateSnapshot>,
    extremities: HashMap<String, BTreeSet<String>>,
    rooms: HashMap<String, RoomRecord>,
    /// destination → events owed, oldest first
    outbound: HashMap<String, Vec<Arc<Event>>>,
}

/// Every store over a single `RwLock`ed map set.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events across all rooms.
    pub async fn len(&self) -> usize {
        self.inner.read().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn put(&self, event: &Event) -> StoreResult<PutOutcome> {
        let canonical = event.canonical_bytes()?;
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.events.get(&event.event_id) {
            return if existing.canonical == canonical {
                Ok(PutOutcome::AlreadyPresent)
            } else {
                Err(StoreError::DuplicateEvent(event.event_id.clone()))
            };
        }

        inner.next_position += 1;
        let position = inner.next_position;
        inner
            .by_room
            .entry(event.room_id.clone())
            .or_default()
            .push((position, event.event_id.clone()));
        inner.events.insert(
            event.event_id.clone(),
            StoredBytes { position, canonical, event: Arc::new(event.clone()) },
        );
        Ok(PutOutcome::Inserted)
    }

    async fn get(&self, event_id: &str) -> StoreResult<Arc<Event>> {
        self.inner
            .read()
            .await
            .events
            .get(event_id)
            .map(|s| s.event.clone())
            .ok_or_else(|| StoreError::not_found("event", event_id))
    }

    fn events_for_room(&self, room_id: &str, after: Option<i64>) -> EventStream<'static> {
        let inner = self.inner.clone();
        let room_id = room_id.to_owned();
        paged(after.unwrap_or(0), ROOM_PAGE_SIZE, move |cursor, limit| {
            fetch_room_page(inner.clone(), room_id.clone(), cursor, limit)
        })
    }
}

async fn fetch_room_page(
    inner: Arc<RwLock<Inner>>,
    room_id: String,
    cursor: i64,
    limit: usize,
) -> StoreResult<Vec<StoredEvent>> {
    let inner = inner.read().await;
    let Some(ids) = inner.by_room.get(&room_id) else {
        return Ok(Vec::new());
    };
    // Positions are strictly increasing within a room.
    let start = ids.partition_point(|(pos, _)| *pos <= cursor);
    Ok(ids[start..]
        .iter()
        .take(limit)
        .filter_map(|(pos, id)| {
            inner.events.get(id).map(|s| StoredEvent { position: *pos, event: s.event.clone() })
        })
        .collect())
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn set_event_meta(&self, event_id: &str, meta: &EventMeta) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let seq = match inner.meta.get(event_id) {
            Some((seq, _)) => *seq,
            None => {
                inner.next_meta_seq += 1;
                inner.next_meta_seq
            }
        };
        inner.meta.insert(event_id.to_owned(), (seq, meta.clone()));
        Ok(())
    }

    async fn event_meta(&self, event_id: &str) -> StoreResult<Option<EventMeta>> {
        Ok(self.inner.read().await.meta.get(event_id).map(|(_, m)| m.clone()))
    }

    async fn outliers_for_room(&self, room_id: &str) -> StoreResult<Vec<String>> {
        let inner = self.inner.read().await;
        let mut outliers: Vec<(u64, &String)> = inner
            .meta
            .iter()
            .filter(|(_, (_, m))| m.room_id == room_id && m.status.is_outlier())
            .map(|(id, (seq, _))| (*seq, id))
            .collect();
        outliers.sort();
        Ok(outliers.into_iter().map(|(_, id)| id.clone()).collect())
    }

    async fn forget_outlier(&self, event_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.meta.get(event_id).is_some_and(|(_, m)| m.status.is_outlier()) {
            inner.meta.remove(event_id);
        }
        Ok(())
    }

    async fn put_snapshot(&self, id: SnapshotId, snapshot: &StateSnapshot) -> StoreResult<()> {
        self.inner.write().await.snapshots.insert(id, snapshot.clone());
        Ok(())
    }

    async fn get_snapshot(&self, id: SnapshotId) -> StoreResult<StateSnapshot> {
        self.inner
            .read()
            .await
            .snapshots
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("snapshot", id.to_string()))
    }

    async fn forward_extremities(&self, room_id: &str) -> StoreResult<BTreeSet<String>> {
        Ok(self.inner.read().await.extremities.get(room_id).cloned().unwrap_or_default())
    }

    async fn set_forward_extremities(
        &self,
        room_id: &str,
        extremities: &BTreeSet<String>,
    ) -> StoreResult<()> {
        self.inner.write().await.extremities.insert(room_id.to_owned(), extremities.clone());
        Ok(())
    }

    async fn put_room(&self, room: &RoomRecord) -> StoreResult<()> {
        self.inner.write().await.rooms.insert(room.room_id.clone(), room.clone());
        Ok(())
    }

    async fn room(&self, room_id: &str) -> StoreResult<Option<RoomRecord>> {
        Ok(self.inner.read().await.rooms.get(room_id).cloned())
    }
}

#[async_trait]
impl OutboundStore for MemoryStore {
    async fn push_outbound(&self, destination: &str, event: &Arc<Event>) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let queue = inner.outbound.entry(destination.to_owned()).or_default();
        if !queue.iter().any(|e| e.event_id == event.event_id) {
            queue.push(event.clone());
        }
        Ok(())
    }

    async fn remove_outbound(&self, destination: &str, event_ids: &[String]) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(queue) = inner.outbound.get_mut(destination) {
            queue.retain(|e| !event_ids.contains(&e.event_id));
            if queue.is_empty() {
                inner.outbound.remove(destination);
            }
        }
        Ok(())
    }

    async fn clear_outbound(&self, destination: &str) -> StoreResult<u64> {
        let dropped = self.inner.write().await.outbound.remove(destination);
        Ok(dropped.map_or(0, |q| q.len() as u64))
    }

    async fn pending_outbound(&self) -> StoreResult<Vec<(String, Arc<Event>)>> {
        let inner = self.inner.read().await;
        let mut destinations: Vec<&String> = inner.outbound.keys().collect();
        destinations.sort();
        Ok(destinations
            .into_iter()
            .flat_map(|d| inner.outbound[d].iter().map(move |e| (d.clone(), e.clone())))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use hearth_common::event::kinds;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn event(room: &str, n: i64) -> Event {
        let mut ev = Event {
            event_id: String::new(),
            room_id: room.into(),
            sender: "@alice:a.test".into(),
            event_type: kinds::MESSAGE.into(),
            state_key: None,
            content: json!({ "body": n }),
            prev_events: vec![],
            auth_events: vec![],
            depth: 1,
            origin_server_ts: n,
            signatures: BTreeMap::new(),
        };
        ev.seal().unwrap();
        ev
    }

    #[tokio::test]
    async fn put_is_idempotent_for_identical_bytes() {
        let store = MemoryStore::new();
        let ev = event("!r:a.test", 1);
        assert_eq!(store.put(&ev).await.unwrap(), PutOutcome::Inserted);
        assert_eq!(store.put(&ev).await.unwrap(), PutOutcome::AlreadyPresent);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn put_rejects_different_bytes_under_same_id() {
        let store = MemoryStore::new();
        let ev = event("!r:a.test", 1);
        store.put(&ev).await.unwrap();

        let mut resigned = ev.clone();
        resigned.signatures.entry("a.test".into()).or_default().insert("ed25519:x".into(), "s".into());
        assert!(matches!(store.put(&resigned).await, Err(StoreError::DuplicateEvent(_))));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = MemoryStore::new();
        assert!(store.get("$nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn room_stream_is_insertion_ordered_and_restartable() {
        let store = MemoryStore::new();
        for n in 0..(ROOM_PAGE_SIZE as i64 + 10) {
            store.put(&event("!r:a.test", n)).await.unwrap();
            store.put(&event("!other:a.test", n)).await.unwrap();
        }

        let all: Vec<_> = store
            .events_for_room("!r:a.test", None)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(all.len(), ROOM_PAGE_SIZE + 10);
        assert!(all.windows(2).all(|w| w[0].position < w[1].position));
        assert!(all.iter().all(|s| s.event.room_id == "!r:a.test"));

        let resume_at = all[99].position;
        let rest: Vec<_> = store
            .events_for_room("!r:a.test", Some(resume_at))
            .map(|r| r.unwrap().event.event_id.clone())
            .collect()
            .await;
        let expected: Vec<_> = all[100..].iter().map(|s| s.event.event_id.clone()).collect();
        assert_eq!(rest, expected);
    }

    #[tokio::test]
    async fn outliers_listed_oldest_first() {
        let store = MemoryStore::new();
        store.set_event_meta("$b", &EventMeta::outlier("!r:a.test")).await.unwrap();
        store.set_event_meta("$a", &EventMeta::outlier("!r:a.test")).await.unwrap();
        store.set_event_meta("$c", &EventMeta::outlier("!x:a.test")).await.unwrap();
        assert_eq!(store.outliers_for_room("!r:a.test").await.unwrap(), vec!["$b", "$a"]);
    }

    #[tokio::test]
    async fn forgetting_an_outlier_leaves_accepted_events_alone() {
        let store = MemoryStore::new();
        store.set_event_meta("$o", &EventMeta::outlier("!r:a.test")).await.unwrap();
        let accepted = EventMeta { status: crate::EventStatus::Accepted, ..EventMeta::outlier("!r:a.test") };
        store.set_event_meta("$a", &accepted).await.unwrap();

        store.forget_outlier("$o").await.unwrap();
        store.forget_outlier("$a").await.unwrap();
        assert!(store.event_meta("$o").await.unwrap().is_none());
        assert_eq!(store.event_meta("$a").await.unwrap(), Some(accepted));
    }

    #[tokio::test]
    async fn outbound_queue_keeps_push_order_per_destination() {
        let store = MemoryStore::new();
        let (e1, e2, e3) = (Arc::new(event("!r:a.test", 1)), Arc::new(event("!r:a.test", 2)), Arc::new(event("!r:a.test", 3)));
        store.push_outbound("c.test", &e3).await.unwrap();
        store.push_outbound("b.test", &e1).await.unwrap();
        store.push_outbound("b.test", &e2).await.unwrap();
        store.push_outbound("b.test", &e1).await.unwrap();

        let pending: Vec<_> = store
            .pending_outbound()
            .await
            .unwrap()
            .into_iter()
            .map(|(d, e)| (d, e.event_id.clone()))
            .collect();
        assert_eq!(
            pending,
            vec![
                ("b.test".to_string(), e1.event_id.clone()),
                ("b.test".to_string(), e2.event_id.clone()),
                ("c.test".to_string(), e3.event_id.clone()),
            ]
        );

        store.remove_outbound("b.test", &[e1.event_id.clone()]).await.unwrap();
        assert_eq!(store.clear_outbound("b.test").await.unwrap(), 1);
        assert_eq!(store.clear_outbound("b.test").await.unwrap(), 0);
        assert_eq!(store.pending_outbound().await.unwrap().len(), 1);
    }
}
