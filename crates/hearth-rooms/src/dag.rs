//! Room DAG manager.
//!
//! Drives every event through `received → (outlier | pending-auth)`,
//! `pending-auth → (accepted | rejected)`. It owns the per-room lock table,
//! the submission pool, the snapshot cache and the outlier index; everything
//! it knows can be rebuilt from the stores with [`RoomDag::rebuild_room`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{StreamExt, future::BoxFuture};
use hearth_common::{
    HearthError, StateEvents, StateKey, StateMap,
    config::AppConfig,
    event::{Event, Membership, kinds},
    ids,
};
use hearth_db::{
    EventMeta, EventStatus, EventStore, RoomRecord, SnapshotId, StateStore, StoreError, Stores,
};
use serde_json::Value;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    auth::{AuthVerdict, auth_types_for, check_auth, check_shape, select_auth_events},
    locks::RoomLocks,
    outliers::OutlierIndex,
    room_version::RoomVersion,
    snapshots::{self, SnapshotCache},
    state_res::{EventMap, Partition, ResolveError, StateResolver},
};

// ─── Hooks ───────────────────────────────────────────────────────────────────

/// Where accepted events are sent to other servers.
///
/// Called with the room lock held, so a room's events reach each destination
/// queue in acceptance order. Implementations must not submit events.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn enqueue(&self, destination: &str, event: Arc<Event>);

    /// Drop whatever is still queued for `room_id` to `destination`.
    async fn cancel_room(&self, destination: &str, room_id: &str);
}

/// Fetches events this server has not seen.
#[async_trait]
pub trait BackfillHook: Send + Sync {
    /// Return the requested events (and any ancestors the remote chooses to
    /// include), oldest first where possible. `servers` are candidates to ask.
    async fn fetch_missing_events(
        &self,
        room_id: &str,
        event_ids: &[String],
        servers: &[String],
    ) -> anyhow::Result<Vec<Event>>;
}

/// Signs locally built events.
pub trait EventSigner: Send + Sync {
    fn sign_event(&self, event: &mut Event) -> anyhow::Result<()>;
}

// ─── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DagConfig {
    pub server_name: String,
    pub default_room_version: String,
    pub lock_shards: usize,
    pub max_backfill_depth: usize,
    pub max_delta_chain: u32,
    pub snapshot_cache_size: usize,
    /// Outliers kept per room; the oldest is forgotten past this.
    pub max_outliers_per_room: usize,
    /// Submissions processed at once, local and federated together.
    pub submission_concurrency: usize,
    pub relay_remote_events: bool,
}

impl Default for DagConfig {
    fn default() -> Self {
        Self {
            server_name: "localhost".into(),
            default_room_version: RoomVersion::latest().id.into(),
            lock_shards: 64,
            max_backfill_depth: 8,
            max_delta_chain: 64,
            snapshot_cache_size: 4096,
            max_outliers_per_room: 1000,
            submission_concurrency: 16,
            relay_remote_events: true,
        }
    }
}

impl From<&AppConfig> for DagConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            server_name: cfg.server.name.clone(),
            default_room_version: cfg.rooms.default_room_version.clone(),
            lock_shards: cfg.rooms.lock_shards,
            max_backfill_depth: cfg.rooms.max_backfill_depth,
            max_delta_chain: cfg.rooms.max_delta_chain,
            snapshot_cache_size: cfg.rooms.snapshot_cache_size,
            max_outliers_per_room: cfg.rooms.max_outliers_per_room,
            submission_concurrency: cfg.rooms.submission_concurrency,
            relay_remote_events: cfg.federation.relay_remote_events,
        }
    }
}

/// How an event reached this server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Local,
    /// In a transaction sent by `via`.
    Federation { via: String },
    /// Fetched to fill a gap, or an outlier being retried.
    Backfill,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub event_id: String,
    pub outcome: Outcome,
    /// The event had already been processed; nothing changed.
    pub duplicate: bool,
}

impl Submission {
    pub fn is_accepted(&self) -> bool {
        self.outcome == Outcome::Accepted
    }
}

/// A local event before prev/auth events, depth and signatures are filled in.
#[derive(Debug, Clone)]
pub struct EventTemplate {
    pub room_id: String,
    pub sender: String,
    pub event_type: String,
    pub state_key: Option<String>,
    pub content: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum DagError {
    #[error("malformed event: {0}")]
    Validation(String),

    #[error("event '{event_id}' has unknown prev events: {}", missing.join(", "))]
    MissingPrevEvents { event_id: String, missing: Vec<String> },

    #[error("room '{0}' is not known")]
    UnknownRoom(String),

    #[error("unsupported room version '{0}'")]
    UnsupportedRoomVersion(String),

    #[error("event rejected: {0}")]
    Rejected(String),

    #[error("event '{0}' has no state on this server")]
    NoState(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("signing failed: {0}")]
    Signing(#[source] anyhow::Error),

    #[error("submissions are closed")]
    Closed,
}

impl From<DagError> for HearthError {
    fn from(e: DagError) -> Self {
        match e {
            DagError::Validation(message) | DagError::UnsupportedRoomVersion(message) => {
                HearthError::Validation { message }
            }
            DagError::MissingPrevEvents { missing, .. } => HearthError::MissingPrevEvents { missing },
            DagError::UnknownRoom(room) => HearthError::NotFound { resource: format!("room {room}") },
            DagError::NoState(id) => HearthError::NotFound { resource: format!("state at {id}") },
            DagError::Rejected(reason) => HearthError::Unauthorized { reason },
            DagError::Store(e) => e.into(),
            other => HearthError::Internal(anyhow::anyhow!(other)),
        }
    }
}

type DagResult<T> = Result<T, DagError>;

/// State in effect before an event, derived from its prev events.
struct PrevState {
    state: Arc<StateMap>,
    /// Existing snapshot holding exactly `state`, if any.
    snapshot: Option<SnapshotId>,
    /// Snapshot to delta-encode against when `state` needs storing.
    base: Option<SnapshotId>,
}

/// Sends planned for an accepted event.
struct FanOut {
    event: Arc<Event>,
    destinations: BTreeSet<String>,
    /// Servers whose last member just left; their stale queue is cancelled first.
    departed: BTreeSet<String>,
}

// ─── Manager ─────────────────────────────────────────────────────────────────

pub struct RoomDag {
    events: Arc<dyn EventStore>,
    state: Arc<dyn StateStore>,
    config: DagConfig,
    locks: RoomLocks,
    permits: Semaphore,
    snapshots: SnapshotCache,
    outliers: OutlierIndex,
    sink: Option<Arc<dyn OutboundSink>>,
    backfill: Option<Arc<dyn BackfillHook>>,
    signer: Option<Arc<dyn EventSigner>>,
}

impl RoomDag {
    pub fn new(stores: Stores, config: DagConfig) -> Self {
        Self {
            events: stores.events,
            state: stores.state,
            locks: RoomLocks::new(config.lock_shards),
            permits: Semaphore::new(config.submission_concurrency.max(1)),
            snapshots: SnapshotCache::new(config.snapshot_cache_size),
            outliers: OutlierIndex::new(config.max_outliers_per_room),
            config,
            sink: None,
            backfill: None,
            signer: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutboundSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_backfill(mut self, hook: Arc<dyn BackfillHook>) -> Self {
        self.backfill = Some(hook);
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn EventSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn server_name(&self) -> &str {
        &self.config.server_name
    }

    // ── Submission ──────────────────────────────────────────────────────────

    /// Submit an event received locally or from another server.
    pub async fn submit_event(&self, event: Event, origin: Origin) -> DagResult<Submission> {
        self.submit_at_depth(event, origin, 0).await
    }

    fn submit_at_depth(&self, event: Event, origin: Origin, depth: usize) -> BoxFuture<'_, DagResult<Submission>> {
        Box::pin(async move {
            check_shape(&event).map_err(|r| DagError::Validation(r.to_string()))?;

            if let Some(prior) = self.prior_outcome(&event.event_id).await? {
                debug!(event_id = %event.event_id, "Duplicate submission");
                return Ok(prior);
            }

            let missing = self.missing_prevs(&event).await?;
            if !missing.is_empty() && depth < self.config.max_backfill_depth {
                self.fill_gap(&event, &missing, &origin, depth).await;
            }

            let room_id = event.room_id.clone();
            let submission = self.accept_if_ready(event, &origin).await?;
            if submission.is_accepted() && !submission.duplicate {
                self.retry_outliers(&room_id, &submission.event_id).await;
            }
            Ok(submission)
        })
    }

    /// Under the room lock: accept `event` if every prev event has state,
    /// else keep it as an outlier. Fan-out is queued before the lock is
    /// released.
    async fn accept_if_ready(&self, event: Event, origin: &Origin) -> DagResult<Submission> {
        let room_id = event.room_id.clone();
        let _guard = self.locks.lock(&room_id).await;
        if let Some(prior) = self.prior_outcome(&event.event_id).await? {
            return Ok(prior);
        }
        let missing = self.missing_prevs(&event).await?;
        if !missing.is_empty() {
            self.store_outlier(&event, &missing).await?;
            return Err(DagError::MissingPrevEvents { event_id: event.event_id, missing });
        }

        let (submission, fan_out) = self.accept_locked(event, origin).await?;
        self.outliers.remove(&room_id, &submission.event_id);
        if let Some(fan_out) = fan_out {
            self.send(fan_out).await;
        }
        Ok(submission)
    }

    /// A slot in the submission pool shared by local clients and federation
    /// ingress. Held for the whole submission.
    pub async fn submission_permit(&self) -> DagResult<SemaphorePermit<'_>> {
        self.permits.acquire().await.map_err(|_| DagError::Closed)
    }

    /// Build, sign and submit a local event. Returns its id.
    pub async fn submit_local(&self, template: EventTemplate) -> DagResult<String> {
        let _permit = self.submission_permit().await?;
        let event = self.build_local_event(template).await?;
        let submission = self.submit_event(event, Origin::Local).await?;
        match submission.outcome {
            Outcome::Accepted => Ok(submission.event_id),
            Outcome::Rejected(reason) => Err(DagError::Rejected(reason)),
        }
    }

    /// Fill in prev events, auth events, depth and timestamp for `template`
    /// on top of the room's current extremities, then hash and sign it.
    pub async fn build_local_event(&self, template: EventTemplate) -> DagResult<Event> {
        if ids::server_name_of(&template.sender) != Some(self.config.server_name.as_str()) {
            return Err(DagError::Validation(format!(
                "sender '{}' is not a local user",
                template.sender
            )));
        }

        let mut event = Event {
            event_id: String::new(),
            room_id: template.room_id,
            sender: template.sender,
            event_type: template.event_type,
            state_key: template.state_key,
            content: template.content,
            prev_events: Vec::new(),
            auth_events: Vec::new(),
            depth: 1,
            origin_server_ts: chrono::Utc::now().timestamp_millis(),
            signatures: BTreeMap::new(),
        };

        if !event.is_type(kinds::CREATE) {
            let version = self.room_version(&event.room_id).await?;
            let extremities = self.state.forward_extremities(&event.room_id).await?;
            if extremities.is_empty() {
                return Err(DagError::UnknownRoom(event.room_id));
            }
            event.prev_events = extremities.into_iter().collect();

            let mut max_depth = 0;
            for prev in &event.prev_events {
                max_depth = max_depth.max(self.events.get(prev).await?.depth);
            }
            event.depth = max_depth + 1;

            let prev = self.prev_state(&event.room_id, &event.prev_events, version).await?;
            let auth_state = self.load_state_events(&prev.state, &auth_types_for(&event)).await?;
            event.auth_events = select_auth_events(&event, &auth_state).into_iter().collect();
        }

        event.seal().map_err(|e| DagError::Validation(e.to_string()))?;
        if let Some(signer) = &self.signer {
            signer.sign_event(&mut event).map_err(DagError::Signing)?;
        }
        Ok(event)
    }

    async fn prior_outcome(&self, event_id: &str) -> DagResult<Option<Submission>> {
        let outcome = match self.state.event_meta(event_id).await?.map(|m| m.status) {
            None | Some(EventStatus::Outlier) => return Ok(None),
            Some(EventStatus::Accepted) => Outcome::Accepted,
            Some(EventStatus::Rejected(reason)) => Outcome::Rejected(reason),
        };
        Ok(Some(Submission { event_id: event_id.to_owned(), outcome, duplicate: true }))
    }

    /// Prev events without computed state on this server.
    async fn missing_prevs(&self, event: &Event) -> DagResult<Vec<String>> {
        let mut missing = Vec::new();
        for prev in &event.prev_events {
            match self.state.event_meta(prev).await? {
                Some(meta) if meta.state_after.is_some() => {}
                _ => missing.push(prev.clone()),
            }
        }
        Ok(missing)
    }

    /// Ask the backfill hook for `missing` and submit whatever comes back.
    async fn fill_gap(&self, event: &Event, missing: &[String], origin: &Origin, depth: usize) {
        let Some(hook) = &self.backfill else { return };

        let mut servers: Vec<String> = Vec::new();
        if let Origin::Federation { via } = origin {
            servers.push(via.clone());
        }
        if let Some(server) = event.origin() {
            servers.push(server.to_owned());
        }
        if let Ok(joined) = self.joined_servers(&event.room_id).await {
            servers.extend(joined);
        }
        servers.retain(|s| *s != self.config.server_name);
        let mut seen = BTreeSet::new();
        servers.retain(|s| seen.insert(s.clone()));

        let mut fetched = match hook.fetch_missing_events(&event.room_id, missing, &servers).await {
            Ok(events) => events,
            Err(e) => {
                warn!(room_id = %event.room_id, error = %e, "Backfill failed");
                return;
            }
        };
        fetched.retain(|ev| ev.room_id == event.room_id);
        fetched.sort_by(|a, b| (a.depth, &a.event_id).cmp(&(b.depth, &b.event_id)));
        debug!(room_id = %event.room_id, count = fetched.len(), depth, "Submitting backfilled events");

        for ev in fetched {
            let id = ev.event_id.clone();
            if let Err(e) = self.submit_at_depth(ev, Origin::Backfill, depth + 1).await {
                debug!(event_id = %id, error = %e, "Backfilled event not accepted");
            }
        }
    }

    /// Store the event bytes. A copy under the same id that differs only in
    /// signatures is already as good as this one.
    async fn persist(&self, event: &Event) -> DagResult<()> {
        match self.events.put(event).await {
            Ok(_) | Err(StoreError::DuplicateEvent(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn store_outlier(&self, event: &Event, missing: &[String]) -> DagResult<()> {
        self.persist(event).await?;
        if self.state.event_meta(&event.event_id).await?.is_none() {
            self.state.set_event_meta(&event.event_id, &EventMeta::outlier(&event.room_id)).await?;
        }
        info!(room_id = %event.room_id, event_id = %event.event_id, missing = missing.len(), "Stored outlier");
        for evicted in self.outliers.insert(&event.room_id, &event.event_id, missing) {
            self.drop_outlier(&event.room_id, &evicted).await?;
        }
        Ok(())
    }

    async fn drop_outlier(&self, room_id: &str, event_id: &str) -> DagResult<()> {
        warn!(room_id = %room_id, event_id = %event_id, "Dropping outlier; too many waiting in room");
        self.state.forget_outlier(event_id).await?;
        Ok(())
    }

    /// Register the room's stored outliers the first time it is touched
    /// since start. Returns those whose prev events have all arrived.
    async fn load_outliers(&self, room_id: &str) -> DagResult<Vec<String>> {
        if self.outliers.is_loaded(room_id) {
            return Ok(Vec::new());
        }
        let mut ready = Vec::new();
        for id in self.state.outliers_for_room(room_id).await? {
            let missing = match self.events.get(&id).await {
                Ok(event) => self.missing_prevs(&event).await?,
                Err(e) => {
                    warn!(room_id = %room_id, event_id = %id, error = %e, "Unreadable outlier");
                    continue;
                }
            };
            if missing.is_empty() {
                ready.push(id);
                continue;
            }
            for evicted in self.outliers.insert(room_id, &id, &missing) {
                self.drop_outlier(room_id, &evicted).await?;
            }
        }
        self.outliers.mark_loaded(room_id);
        Ok(ready)
    }

    /// Retry the outliers that were waiting for `accepted`. Failures are
    /// logged, never returned: `accepted` is already in the DAG.
    async fn retry_outliers(&self, room_id: &str, accepted: &str) {
        let mut todo = match self.load_outliers(room_id).await {
            Ok(ready) => ready,
            Err(e) => {
                warn!(room_id = %room_id, error = %e, "Could not load outliers");
                Vec::new()
            }
        };
        todo.extend(self.outliers.take_waiting(accepted));
        self.resolve_outliers(room_id, todo).await;
    }

    /// Accept what can be accepted of `todo`, then whatever that unblocks.
    async fn resolve_outliers(&self, room_id: &str, mut todo: Vec<String>) {
        while let Some(id) = todo.pop() {
            match self.retry_outlier(&id).await {
                Ok(true) => {
                    debug!(room_id = %room_id, event_id = %id, "Outlier resolved");
                    todo.extend(self.outliers.take_waiting(&id));
                }
                Ok(false) => {}
                Err(e) => warn!(room_id = %room_id, event_id = %id, error = %e, "Outlier retry failed"),
            }
        }
    }

    /// `Ok(true)` once the outlier has been accepted.
    async fn retry_outlier(&self, event_id: &str) -> DagResult<bool> {
        let event = self.events.get(event_id).await?;
        if !self.missing_prevs(&event).await?.is_empty() {
            return Ok(false);
        }
        let submission = self.accept_if_ready(event.as_ref().clone(), &Origin::Backfill).await?;
        Ok(submission.is_accepted())
    }

    /// Authorise and persist an event whose prev events are all known. The
    /// caller holds the room lock.
    async fn accept_locked(&self, event: Event, origin: &Origin) -> DagResult<(Submission, Option<FanOut>)> {
        let room_id = event.room_id.clone();
        let is_create = event.is_type(kinds::CREATE);

        let version = if is_create {
            self.check_new_room(&event).await?
        } else {
            self.room_version(&room_id).await?
        };

        let prev = if is_create {
            PrevState { state: Arc::new(StateMap::new()), snapshot: None, base: None }
        } else {
            self.prev_state(&room_id, &event.prev_events, version).await?
        };
        let state_before = match prev.snapshot {
            Some(id) => id,
            None => self.store_snapshot(&room_id, prev.base, &prev.state).await?,
        };

        let auth_state = self.load_state_events(&prev.state, &auth_types_for(&event)).await?;
        let verdict = check_auth(&event, &auth_state, version);

        self.persist(&event).await?;
        let event = Arc::new(event);

        let reason = match verdict {
            AuthVerdict::Allowed => None,
            AuthVerdict::Rejected(reason) => Some(reason.to_string()),
        };
        if let Some(reason) = reason {
            warn!(room_id = %room_id, event_id = %event.event_id, %reason, "Event rejected");
            self.state
                .set_event_meta(
                    &event.event_id,
                    &EventMeta {
                        room_id: room_id.clone(),
                        status: EventStatus::Rejected(reason.clone()),
                        state_before: Some(state_before),
                        state_after: Some(state_before),
                    },
                )
                .await?;
            let submission = Submission { event_id: event.event_id.clone(), outcome: Outcome::Rejected(reason), duplicate: false };
            return Ok((submission, None));
        }

        let state_after_map = match event.state_slot() {
            Some(slot) => {
                let mut after = prev.state.as_ref().clone();
                after.insert(slot, event.event_id.clone());
                Arc::new(after)
            }
            None => prev.state.clone(),
        };
        let state_after = if event.is_state() {
            self.store_snapshot(&room_id, Some(state_before), &state_after_map).await?
        } else {
            state_before
        };

        self.state
            .set_event_meta(
                &event.event_id,
                &EventMeta {
                    room_id: room_id.clone(),
                    status: EventStatus::Accepted,
                    state_before: Some(state_before),
                    state_after: Some(state_after),
                },
            )
            .await?;

        let mut extremities = self.state.forward_extremities(&room_id).await?;
        for prev_id in &event.prev_events {
            extremities.remove(prev_id);
        }
        extremities.insert(event.event_id.clone());
        self.state.set_forward_extremities(&room_id, &extremities).await?;

        if is_create {
            self.state
                .put_room(&RoomRecord {
                    room_id: room_id.clone(),
                    room_version: version.id.to_owned(),
                    create_event_id: event.event_id.clone(),
                })
                .await?;
            info!(room_id = %room_id, room_version = version.id, "Room created");
        }
        debug!(room_id = %room_id, event_id = %event.event_id, ?origin, "Event accepted");

        let fan_out = self.plan_fan_out(&event, origin, &prev.state, &state_after_map).await?;
        let submission = Submission { event_id: event.event_id.clone(), outcome: Outcome::Accepted, duplicate: false };
        Ok((submission, fan_out))
    }

    /// Room version for a new room, refusing a second create event.
    async fn check_new_room(&self, create: &Event) -> DagResult<&'static RoomVersion> {
        if let Some(existing) = self.state.room(&create.room_id).await? {
            if existing.create_event_id != create.event_id {
                return Err(DagError::Validation(format!("room '{}' already exists", create.room_id)));
            }
        }
        let id = match create.content.get("room_version") {
            Some(Value::String(v)) => v.as_str(),
            Some(_) => return Err(DagError::Validation("room_version is not a string".into())),
            None => self.config.default_room_version.as_str(),
        };
        RoomVersion::from_id(id).ok_or_else(|| DagError::UnsupportedRoomVersion(id.to_owned()))
    }

    // ── Fan-out ─────────────────────────────────────────────────────────────

    async fn plan_fan_out(
        &self,
        event: &Arc<Event>,
        origin: &Origin,
        before: &StateMap,
        after: &StateMap,
    ) -> DagResult<Option<FanOut>> {
        if self.sink.is_none() {
            return Ok(None);
        }
        let own = self.config.server_name.as_str();
        let joined_after = self.joined_servers_in(after).await?;

        let (destinations, departed) = match origin {
            Origin::Local => {
                let mut departed = BTreeSet::new();
                if event.is_type(kinds::MEMBER) {
                    departed = self.joined_servers_in(before).await?;
                    departed.retain(|s| !joined_after.contains(s) && s != own);
                }
                let mut destinations = joined_after;
                destinations.remove(own);
                (destinations, departed)
            }
            // The origin sent to everyone joined at the event. Only the first
            // hop relays, to servers joined on branches the origin had not seen.
            Origin::Federation { via }
                if self.config.relay_remote_events && event.origin() == Some(via.as_str()) =>
            {
                let mut destinations = self.joined_servers(&event.room_id).await?;
                destinations.retain(|s| !joined_after.contains(s) && s != own && s != via);
                (destinations, BTreeSet::new())
            }
            Origin::Federation { .. } | Origin::Backfill => return Ok(None),
        };

        if destinations.is_empty() && departed.is_empty() {
            return Ok(None);
        }
        Ok(Some(FanOut { event: event.clone(), destinations, departed }))
    }

    async fn send(&self, fan_out: FanOut) {
        let Some(sink) = &self.sink else { return };
        let room_id = fan_out.event.room_id.as_str();
        for server in &fan_out.departed {
            sink.cancel_room(server, room_id).await;
            sink.enqueue(server, fan_out.event.clone()).await;
        }
        for server in &fan_out.destinations {
            sink.enqueue(server, fan_out.event.clone()).await;
        }
    }

    // ── State ───────────────────────────────────────────────────────────────

    /// State after all of `prevs`, resolving if their states differ.
    async fn prev_state(&self, room_id: &str, prevs: &[String], version: &RoomVersion) -> DagResult<PrevState> {
        let mut snapshots: Vec<SnapshotId> = Vec::with_capacity(prevs.len());
        for prev in prevs {
            let meta = self
                .state
                .event_meta(prev)
                .await?
                .ok_or_else(|| DagError::NoState(prev.clone()))?;
            if meta.room_id != room_id {
                return Err(DagError::Validation(format!("prev event '{prev}' is in another room")));
            }
            snapshots.push(meta.state_after.ok_or_else(|| DagError::NoState(prev.clone()))?);
        }
        snapshots.sort();
        snapshots.dedup();

        let first = *snapshots.first().ok_or_else(|| DagError::Validation("no prev events".into()))?;
        let mut states = Vec::with_capacity(snapshots.len());
        for id in &snapshots {
            states.push(self.materialise(*id).await?);
        }
        if states.iter().all(|s| s == &states[0]) {
            return Ok(PrevState { state: states[0].clone(), snapshot: Some(first), base: None });
        }

        let maps: Vec<StateMap> = states.iter().map(|s| s.as_ref().clone()).collect();
        let partition = Partition::of(&maps);
        let mut events = EventMap::new();
        let referenced: BTreeSet<&String> = maps.iter().flat_map(|m| m.values()).collect();
        for id in referenced {
            events.insert(id.clone(), self.events.get(id).await?);
        }
        self.load_auth_chains(partition.conflicted_ids(), &mut events).await?;

        let resolved = StateResolver::resolve(version, &maps, &events)?;
        debug!(
            room_id = %room_id,
            branches = maps.len(),
            conflicted = partition.conflicted.len(),
            "Resolved state"
        );
        Ok(PrevState { state: Arc::new(resolved), snapshot: None, base: Some(first) })
    }

    async fn load_auth_chains(&self, roots: BTreeSet<String>, events: &mut EventMap) -> DagResult<()> {
        let mut todo: Vec<String> = roots.into_iter().collect();
        let mut seen = BTreeSet::new();
        while let Some(id) = todo.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let ev = match events.get(&id) {
                Some(ev) => ev.clone(),
                None => {
                    let ev = self.events.get(&id).await?;
                    events.insert(id.clone(), ev.clone());
                    ev
                }
            };
            todo.extend(ev.auth_events.iter().cloned());
        }
        Ok(())
    }

    async fn load_state_events(&self, state: &StateMap, keys: &BTreeSet<StateKey>) -> DagResult<StateEvents> {
        let mut loaded = StateEvents::new();
        for key in keys {
            if let Some(id) = state.get(key) {
                loaded.insert(key.clone(), self.events.get(id).await?);
            }
        }
        Ok(loaded)
    }

    async fn materialise(&self, id: SnapshotId) -> DagResult<Arc<StateMap>> {
        if let Some((state, _)) = self.snapshots.get(&id) {
            return Ok(state);
        }

        let mut deltas = Vec::new();
        let mut base: Option<Arc<StateMap>> = None;
        let mut cursor = Some(id);
        let mut chain_len = 0;
        while let Some(sid) = cursor {
            if let Some((state, _)) = self.snapshots.get(&sid) {
                base = Some(state);
                break;
            }
            let snapshot = self.state.get_snapshot(sid).await?;
            if sid == id {
                chain_len = snapshot.chain_len;
            }
            cursor = snapshot.base;
            deltas.push(snapshot.delta);
        }

        let mut state = base.map(|b| b.as_ref().clone()).unwrap_or_default();
        for delta in deltas.into_iter().rev() {
            state.extend(delta);
        }
        let state = Arc::new(state);
        self.snapshots.insert(id, state.clone(), chain_len);
        Ok(state)
    }

    async fn store_snapshot(&self, room_id: &str, base: Option<SnapshotId>, state: &Arc<StateMap>) -> DagResult<SnapshotId> {
        let base_state = match base {
            Some(base_id) => {
                let base_map = self.materialise(base_id).await?;
                let chain_len = match self.snapshots.get(&base_id) {
                    Some((_, len)) => len,
                    None => self.state.get_snapshot(base_id).await?.chain_len,
                };
                Some((base_id, base_map, chain_len))
            }
            None => None,
        };
        let snapshot = snapshots::encode(
            room_id,
            base_state.as_ref().map(|(id, map, len)| (*id, map.as_ref(), *len)),
            state,
            self.config.max_delta_chain,
        );

        let id = Uuid::now_v7();
        self.state.put_snapshot(id, &snapshot).await?;
        self.snapshots.insert(id, state.clone(), snapshot.chain_len);
        Ok(id)
    }

    async fn joined_servers_in(&self, state: &StateMap) -> DagResult<BTreeSet<String>> {
        let mut servers = BTreeSet::new();
        for (key, id) in state.range(StateKey::new(kinds::MEMBER, "")..) {
            if key.event_type != kinds::MEMBER {
                break;
            }
            if self.events.get(id).await?.membership() == Some(Membership::Join) {
                if let Some(server) = ids::server_name_of(&key.state_key) {
                    servers.insert(server.to_owned());
                }
            }
        }
        Ok(servers)
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub async fn room_version(&self, room_id: &str) -> DagResult<&'static RoomVersion> {
        let room = self.state.room(room_id).await?.ok_or_else(|| DagError::UnknownRoom(room_id.to_owned()))?;
        RoomVersion::from_id(&room.room_version).ok_or(DagError::UnsupportedRoomVersion(room.room_version))
    }

    pub async fn forward_extremities(&self, room_id: &str) -> DagResult<BTreeSet<String>> {
        Ok(self.state.forward_extremities(room_id).await?)
    }

    /// Resolved state across the room's forward extremities.
    pub async fn current_state(&self, room_id: &str) -> DagResult<StateMap> {
        let version = self.room_version(room_id).await?;
        let extremities: Vec<String> = self.forward_extremities(room_id).await?.into_iter().collect();
        if extremities.is_empty() {
            return Err(DagError::UnknownRoom(room_id.to_owned()));
        }
        let prev = self.prev_state(room_id, &extremities, version).await?;
        Ok(prev.state.as_ref().clone())
    }

    /// State after `event_id`.
    pub async fn state_at(&self, event_id: &str) -> DagResult<StateMap> {
        let meta = self.meta_with_state(event_id).await?;
        let id = meta.state_after.ok_or_else(|| DagError::NoState(event_id.to_owned()))?;
        Ok(self.materialise(id).await?.as_ref().clone())
    }

    /// State `event_id` was authorised against.
    pub async fn state_before(&self, event_id: &str) -> DagResult<StateMap> {
        let meta = self.meta_with_state(event_id).await?;
        let id = meta.state_before.ok_or_else(|| DagError::NoState(event_id.to_owned()))?;
        Ok(self.materialise(id).await?.as_ref().clone())
    }

    async fn meta_with_state(&self, event_id: &str) -> DagResult<EventMeta> {
        match self.state.event_meta(event_id).await? {
            Some(meta) if !meta.status.is_outlier() => Ok(meta),
            _ => Err(DagError::NoState(event_id.to_owned())),
        }
    }

    /// Servers with at least one joined member in the current state.
    pub async fn joined_servers(&self, room_id: &str) -> DagResult<BTreeSet<String>> {
        let state = self.current_state(room_id).await?;
        self.joined_servers_in(&state).await
    }

    pub async fn event(&self, event_id: &str) -> DagResult<Arc<Event>> {
        Ok(self.events.get(event_id).await?)
    }

    pub async fn event_status(&self, event_id: &str) -> DagResult<Option<EventStatus>> {
        Ok(self.state.event_meta(event_id).await?.map(|m| m.status))
    }

    /// Events between `earliest` (exclusive) and `latest` (inclusive) by
    /// walking prev events backwards, at most `limit`, oldest first.
    pub async fn missing_events(
        &self,
        room_id: &str,
        earliest: &[String],
        latest: &[String],
        limit: usize,
    ) -> DagResult<Vec<Arc<Event>>> {
        let stop: BTreeSet<&String> = earliest.iter().collect();
        let mut seen = BTreeSet::new();
        let mut todo: Vec<String> = latest.to_vec();
        let mut found = Vec::new();

        while let Some(id) = todo.pop() {
            if found.len() >= limit {
                break;
            }
            if stop.contains(&id) || !seen.insert(id.clone()) {
                continue;
            }
            let ev = match self.events.get(&id).await {
                Ok(ev) => ev,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            if ev.room_id != room_id {
                continue;
            }
            todo.extend(ev.prev_events.iter().cloned());
            found.push(ev);
        }
        found.sort_by(|a, b| (a.depth, &a.event_id).cmp(&(b.depth, &b.event_id)));
        Ok(found)
    }

    /// Recompute the room's extremities from stored metadata and retry its
    /// outliers. Returns the new extremities.
    pub async fn rebuild_room(&self, room_id: &str) -> DagResult<BTreeSet<String>> {
        let extremities = {
            let _guard = self.locks.lock(room_id).await;
            self.snapshots.clear();

            let mut accepted = BTreeSet::new();
            let mut referenced = BTreeSet::new();
            let mut create = None;
            let mut stream = self.events.events_for_room(room_id, None);
            while let Some(stored) = stream.next().await {
                let stored = stored?;
                let ev = stored.event;
                if !matches!(self.event_status(&ev.event_id).await?, Some(EventStatus::Accepted)) {
                    continue;
                }
                if ev.is_create() {
                    create = Some(ev.clone());
                }
                referenced.extend(ev.prev_events.iter().cloned());
                accepted.insert(ev.event_id.clone());
            }

            if let Some(create) = create {
                if self.state.room(room_id).await?.is_none() {
                    let version = self.check_new_room(&create).await?;
                    self.state
                        .put_room(&RoomRecord {
                            room_id: room_id.to_owned(),
                            room_version: version.id.to_owned(),
                            create_event_id: create.event_id.clone(),
                        })
                        .await?;
                }
            }

            let extremities: BTreeSet<String> = accepted.difference(&referenced).cloned().collect();
            self.state.set_forward_extremities(room_id, &extremities).await?;
            info!(room_id = %room_id, extremities = extremities.len(), "Room rebuilt");
            extremities
        };
        self.outliers.forget_room(room_id);
        let ready = self.load_outliers(room_id).await?;
        self.resolve_outliers(room_id, ready).await;
        Ok(self.forward_extremities(room_id).await.unwrap_or(extremities))
    }
}
