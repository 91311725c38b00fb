//! State Store contract: everything the DAG manager persists about events
//! besides their bytes.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::{
    error::StoreResult,
    model::{EventMeta, RoomRecord, SnapshotId, StateSnapshot},
};

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn set_event_meta(&self, event_id: &str, meta: &EventMeta) -> StoreResult<()>;

    /// `Ok(None)` for events this server never processed.
    async fn event_meta(&self, event_id: &str) -> StoreResult<Option<EventMeta>>;

    /// Outliers of a room, oldest first.
    async fn outliers_for_room(&self, room_id: &str) -> StoreResult<Vec<String>>;

    /// Drop an outlier's metadata so it counts as never processed. Events
    /// with state are left alone; the event bytes always stay.
    async fn forget_outlier(&self, event_id: &str) -> StoreResult<()>;

    async fn put_snapshot(&self, id: SnapshotId, snapshot: &StateSnapshot) -> StoreResult<()>;

    async fn get_snapshot(&self, id: SnapshotId) -> StoreResult<StateSnapshot>;

    async fn forward_extremities(&self, room_id: &str) -> StoreResult<BTreeSet<String>>;

    /// Replace the room's extremity set atomically.
    async fn set_forward_extremities(
        &self,
        room_id: &str,
        extremities: &BTreeSet<String>,
    ) -> StoreResult<()>;

    async fn put_room(&self, room: &RoomRecord) -> StoreResult<()>;

    async fn room(&self, room_id: &str) -> StoreResult<Option<RoomRecord>>;
}
