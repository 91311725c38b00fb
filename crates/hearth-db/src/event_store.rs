//! Event Store contract.
//!
//! Content-addressed and append-only: an identifier maps to exactly one byte
//! string forever. Writes of the same event are idempotent, writes of a
//! different event under a known identifier fail.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use hearth_common::Event;

use crate::{
    error::StoreResult,
    model::{PutOutcome, StoredEvent},
};

/// Rows fetched per round-trip by [`EventStore::events_for_room`].
pub const ROOM_PAGE_SIZE: usize = 256;

/// Lazy sequence of a room's events in insertion order.
pub type EventStream<'a> = BoxStream<'a, StoreResult<StoredEvent>>;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist `event`. Durable before returning on durable backends.
    ///
    /// `Ok(AlreadyPresent)` when identical bytes are stored already,
    /// `Err(DuplicateEvent)` when the identifier is taken by different bytes.
    async fn put(&self, event: &Event) -> StoreResult<PutOutcome>;

    /// `Err(NotFound)` when absent.
    async fn get(&self, event_id: &str) -> StoreResult<Arc<Event>>;

    /// Events of `room_id` in insertion order, strictly after position
    /// `after` (`None` = from the start). Resume by passing the last
    /// [`StoredEvent::position`] seen.
    fn events_for_room(&self, room_id: &str, after: Option<i64>) -> EventStream<'static>;
}

/// Build a lazy paged stream from a page fetcher `(cursor, limit) → rows`.
///
/// A page shorter than `limit` ends the stream; an error is yielded once and
/// ends it too.
pub(crate) fn paged<F, Fut>(after: i64, limit: usize, fetch: F) -> EventStream<'static>
where
    F: Fn(i64, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StoreResult<Vec<StoredEvent>>> + Send + 'static,
{
    struct Cursor<F> {
        after: i64,
        buffered: VecDeque<StoredEvent>,
        exhausted: bool,
        fetch: F,
    }

    let init = Cursor { after, buffered: VecDeque::new(), exhausted: false, fetch };

    stream::unfold(init, move |mut cur| async move {
        if cur.buffered.is_empty() && !cur.exhausted {
            match (cur.fetch)(cur.after, limit).await {
                Ok(rows) => {
                    cur.exhausted = rows.len() < limit;
                    cur.buffered.extend(rows);
                }
                Err(e) => {
                    cur.exhausted = true;
                    return Some((Err(e), cur));
                }
            }
        }
        let next = cur.buffered.pop_front()?;
        cur.after = next.position;
        Some((Ok(next), cur))
    })
    .boxed()
}
