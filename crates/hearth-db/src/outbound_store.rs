//! Outbound Queue contract.
//!
//! Events owed to another server stay here until that server acknowledges
//! them, so delivery resumes after a restart.

use std::sync::Arc;

use async_trait::async_trait;
use hearth_common::Event;

use crate::error::StoreResult;

#[async_trait]
pub trait OutboundStore: Send + Sync {
    /// Record `event` as owed to `destination`. Idempotent.
    async fn push_outbound(&self, destination: &str, event: &Arc<Event>) -> StoreResult<()>;

    /// Forget `event_ids` for `destination`, once delivered or cancelled.
    async fn remove_outbound(&self, destination: &str, event_ids: &[String]) -> StoreResult<()>;

    /// Forget everything owed to `destination`. Returns how many were dropped.
    async fn clear_outbound(&self, destination: &str) -> StoreResult<u64>;

    /// Every owed event, each destination's in the order they were pushed.
    async fn pending_outbound(&self) -> StoreResult<Vec<(String, Arc<Event>)>>;
}
