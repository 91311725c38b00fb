//! PostgreSQL backend for both stores.
//!
//! Events are stored as canonical JSON text so duplicate detection compares
//! exact bytes. `stream_ordering` (BIGSERIAL) is the insertion position.
//! Inserts into one room hold a transaction-scoped advisory lock on the room,
//! so a room's positions become visible in increasing order and a resumed
//! [`EventStore::events_for_room`] never steps over a late commit.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use hearth_common::{Event, state::{StateEntry, from_entries, to_entries}};
use sqlx::{PgPool, Row as _};
use uuid::Uuid;

use crate::{
    error::{StoreError, StoreResult},
    event_store::{EventStore, EventStream, ROOM_PAGE_SIZE, paged},
    model::{EventMeta, EventStatus, PutOutcome, RoomRecord, SnapshotId, StateSnapshot, StoredEvent},
    outbound_store::OutboundStore,
    state_store::StateStore,
};

/// Health check: verify the database is reachable.
pub async fn health_check(pool: &PgPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn decode_event(json: &str) -> StoreResult<Arc<Event>> {
    Ok(Arc::new(serde_json::from_str(json)?))
}

#[async_trait]
impl EventStore for PgStore {
    async fn put(&self, event: &Event) -> StoreResult<PutOutcome> {
        let canonical = event.canonical_bytes()?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&event.room_id)
            .execute(&mut *tx)
            .await?;
        let inserted = sqlx::query(
            "INSERT INTO events (event_id, room_id, json) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(&event.event_id)
        .bind(&event.room_id)
        .bind(&canonical)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;

        if inserted == 1 {
            return Ok(PutOutcome::Inserted);
        }

        let existing: String = sqlx::query_scalar("SELECT json FROM events WHERE event_id = $1")
            .bind(&event.event_id)
            .fetch_one(&self.pool)
            .await?;

        if existing == canonical {
            Ok(PutOutcome::AlreadyPresent)
        } else {
            Err(StoreError::DuplicateEvent(event.event_id.clone()))
        }
    }

    async fn get(&self, event_id: &str) -> StoreResult<Arc<Event>> {
        let json: Option<String> = sqlx::query_scalar("SELECT json FROM events WHERE event_id = $1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        match json {
            Some(json) => decode_event(&json),
            None => Err(StoreError::not_found("event", event_id)),
        }
    }

    fn events_for_room(&self, room_id: &str, after: Option<i64>) -> EventStream<'static> {
        let pool = self.pool.clone();
        let room_id = room_id.to_owned();
        paged(after.unwrap_or(0), ROOM_PAGE_SIZE, move |cursor, limit| {
            fetch_room_page(pool.clone(), room_id.clone(), cursor, limit)
        })
    }
}

async fn fetch_room_page(
    pool: PgPool,
    room_id: String,
    cursor: i64,
    limit: usize,
) -> StoreResult<Vec<StoredEvent>> {
    let rows = sqlx::query(
        "SELECT stream_ordering, json FROM events \
         WHERE room_id = $1 AND stream_ordering > $2 \
         ORDER BY stream_ordering ASC \
         LIMIT $3",
    )
    .bind(&room_id)
    .bind(cursor)
    .bind(limit as i64)
    .fetch_all(&pool)
    .await?;

    let mut page = Vec::with_capacity(rows.len());
    for row in rows {
        let position: i64 = row.try_get("stream_ordering")?;
        let json: String = row.try_get("json")?;
        page.push(StoredEvent { position, event: decode_event(&json)? });
    }
    Ok(page)
}

#[async_trait]
impl StateStore for PgStore {
    async fn set_event_meta(&self, event_id: &str, meta: &EventMeta) -> StoreResult<()> {
        let reason = match &meta.status {
            EventStatus::Rejected(reason) => Some(reason.as_str()),
            _ => None,
        };
        sqlx::query(
            "INSERT INTO event_meta (event_id, room_id, status, reason, state_before, state_after) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (event_id) DO UPDATE SET \
               status = EXCLUDED.status, reason = EXCLUDED.reason, \
               state_before = EXCLUDED.state_before, state_after = EXCLUDED.state_after",
        )
        .bind(event_id)
        .bind(&meta.room_id)
        .bind(meta.status.as_str())
        .bind(reason)
        .bind(meta.state_before)
        .bind(meta.state_after)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn event_meta(&self, event_id: &str) -> StoreResult<Option<EventMeta>> {
        let row = sqlx::query(
            "SELECT room_id, status, reason, state_before, state_after \
             FROM event_meta WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let status: String = row.try_get("status")?;
        let reason: Option<String> = row.try_get("reason")?;
        let status = match status.as_str() {
            "outlier" => EventStatus::Outlier,
            "accepted" => EventStatus::Accepted,
            "rejected" => EventStatus::Rejected(reason.unwrap_or_default()),
            other => return Err(StoreError::Corrupt(format!("unknown event status '{other}'"))),
        };
        Ok(Some(EventMeta {
            room_id: row.try_get("room_id")?,
            status,
            state_before: row.try_get::<Option<Uuid>, _>("state_before")?,
            state_after: row.try_get::<Option<Uuid>, _>("state_after")?,
        }))
    }

    async fn outliers_for_room(&self, room_id: &str) -> StoreResult<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT event_id FROM event_meta \
             WHERE room_id = $1 AND status = 'outlier' \
             ORDER BY created_at ASC, event_id ASC",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn forget_outlier(&self, event_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM event_meta WHERE event_id = $1 AND status = 'outlier'")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn put_snapshot(&self, id: SnapshotId, snapshot: &StateSnapshot) -> StoreResult<()> {
        let delta = serde_json::to_string(&to_entries(&snapshot.delta))?;
        sqlx::query(
            "INSERT INTO state_snapshots (snapshot_id, room_id, base, chain_len, delta) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (snapshot_id) DO NOTHING",
        )
        .bind(id)
        .bind(&snapshot.room_id)
        .bind(snapshot.base)
        .bind(snapshot.chain_len as i32)
        .bind(delta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_snapshot(&self, id: SnapshotId) -> StoreResult<StateSnapshot> {
        let row = sqlx::query(
            "SELECT room_id, base, chain_len, delta FROM state_snapshots WHERE snapshot_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("snapshot", id.to_string()))?;

        let delta: String = row.try_get("delta")?;
        let entries: Vec<StateEntry> = serde_json::from_str(&delta)?;
        let chain_len: i32 = row.try_get("chain_len")?;
        Ok(StateSnapshot {
            room_id: row.try_get("room_id")?,
            base: row.try_get::<Option<Uuid>, _>("base")?,
            chain_len: chain_len as u32,
            delta: from_entries(entries),
        })
    }

    async fn forward_extremities(&self, room_id: &str) -> StoreResult<BTreeSet<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT event_id FROM forward_extremities WHERE room_id = $1")
                .bind(room_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().collect())
    }

    async fn set_forward_extremities(
        &self,
        room_id: &str,
        extremities: &BTreeSet<String>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM forward_extremities WHERE room_id = $1")
            .bind(room_id)
            .execute(&mut *tx)
            .await?;
        for event_id in extremities {
            sqlx::query("INSERT INTO forward_extremities (room_id, event_id) VALUES ($1, $2)")
                .bind(room_id)
                .bind(event_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn put_room(&self, room: &RoomRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO rooms (room_id, room_version, create_event_id) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (room_id) DO NOTHING",
        )
        .bind(&room.room_id)
        .bind(&room.room_version)
        .bind(&room.create_event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn room(&self, room_id: &str) -> StoreResult<Option<RoomRecord>> {
        let row = sqlx::query("SELECT room_version, create_event_id FROM rooms WHERE room_id = $1")
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(RoomRecord {
                room_id: room_id.to_owned(),
                room_version: row.try_get("room_version")?,
                create_event_id: row.try_get("create_event_id")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl OutboundStore for PgStore {
    async fn push_outbound(&self, destination: &str, event: &Arc<Event>) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO outbound_queue (destination, event_id) VALUES ($1, $2) \
             ON CONFLICT (destination, event_id) DO NOTHING",
        )
        .bind(destination)
        .bind(&event.event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_outbound(&self, destination: &str, event_ids: &[String]) -> StoreResult<()> {
        sqlx::query("DELETE FROM outbound_queue WHERE destination = $1 AND event_id = ANY($2)")
            .bind(destination)
            .bind(event_ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_outbound(&self, destination: &str) -> StoreResult<u64> {
        let dropped = sqlx::query("DELETE FROM outbound_queue WHERE destination = $1")
            .bind(destination)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(dropped)
    }

    async fn pending_outbound(&self) -> StoreResult<Vec<(String, Arc<Event>)>> {
        let rows = sqlx::query(
            "SELECT o.destination, e.json FROM outbound_queue o \
             JOIN events e ON e.event_id = o.event_id \
             ORDER BY o.destination ASC, o.seq ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            let json: String = row.try_get("json")?;
            pending.push((row.try_get("destination")?, decode_event(&json)?));
        }
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use futures_util::StreamExt;
    use hearth_common::event::kinds;
    use serde_json::json;

    use super::*;

    /// Runs against a scratch database named by `HEARTH_TEST_DATABASE_URL`;
    /// without one the test returns early.
    async fn store() -> Option<PgStore> {
        let url = std::env::var("HEARTH_TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        Some(PgStore::new(pool))
    }

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

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn resumed_room_stream_sees_every_concurrent_insert() {
        let Some(store) = store().await else { return };
        let room = format!("!{}:a.test", Uuid::now_v7().simple());

        let writers: Vec<_> = (0..64)
            .map(|n| {
                let store = store.clone();
                let ev = event(&room, n);
                tokio::spawn(async move { store.put(&ev).await.map(|_| ()) })
            })
            .collect();

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let finished = writers.iter().all(|w| w.is_finished());
            let page: Vec<StoredEvent> =
                store.events_for_room(&room, cursor).map(|r| r.unwrap()).collect().await;
            if let Some(last) = page.last() {
                cursor = Some(last.position);
            }
            seen.extend(page.into_iter().map(|s| s.event.event_id.clone()));
            if finished {
                break;
            }
            tokio::task::yield_now().await;
        }
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let mut expected: Vec<String> = (0..64).map(|n| event(&room, n).event_id).collect();
        expected.sort();
        seen.sort();
        assert_eq!(seen, expected);
    }
}
