//! Federation Sender: one outbound queue and worker task per destination.
//!
//! [`FederationSender`] owns a map of destination → command channel. The
//! first event for a destination spawns its worker. A worker keeps its queue
//! in FIFO order, sends up to `max_pdus_per_transaction` events per
//! transaction and reuses the transaction id until that batch is delivered.
//!
//! Failed sends back off exponentially. After `unreachable_threshold`
//! consecutive failures the destination is unreachable: events keep queueing
//! but nothing is sent until a probe succeeds or inbound traffic from the
//! destination calls [`FederationSender::mark_reachable`].
//!
//! With an outbound store attached, every queued event is persisted first and
//! removed once delivered or cancelled. [`FederationSender::shutdown`] leaves
//! the rows behind and [`FederationSender::restore`] queues them again on the
//! next start.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hearth_common::{Event, config::AppConfig};
use hearth_db::{OutboundStore, StoreResult};
use hearth_rooms::OutboundSink;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{client::Transport, types::Transaction};

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub server_name: String,
    pub max_pdus_per_transaction: usize,
    pub queue_capacity: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub unreachable_threshold: u32,
    pub probe_interval: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            server_name: "localhost".into(),
            max_pdus_per_transaction: 50,
            queue_capacity: 1024,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(3600),
            unreachable_threshold: 10,
            probe_interval: Duration::from_secs(300),
        }
    }
}

impl From<&AppConfig> for SenderConfig {
    fn from(cfg: &AppConfig) -> Self {
        let fed = &cfg.federation;
        Self {
            server_name: cfg.server.name.clone(),
            max_pdus_per_transaction: fed.max_pdus_per_transaction,
            queue_capacity: fed.queue_capacity,
            backoff_base: Duration::from_millis(fed.backoff_base_ms),
            backoff_max: Duration::from_millis(fed.backoff_max_ms),
            unreachable_threshold: fed.unreachable_threshold,
            probe_interval: Duration::from_millis(fed.probe_interval_ms),
        }
    }
}

impl SenderConfig {
    /// Delay before the retry that follows the `failures`-th failure.
    fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Healthy,
    BackingOff,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationStatus {
    pub link: LinkState,
    /// Events not yet delivered, in-flight batch included.
    pub queued: usize,
    pub consecutive_failures: u32,
}

/// Commands sent to a destination worker.
#[derive(Debug)]
enum Command {
    Enqueue(Arc<Event>),
    CancelRoom(String),
    MarkReachable,
    Status(oneshot::Sender<DestinationStatus>),
    /// Stop the worker. `discard` also forgets persisted events.
    Stop { discard: bool },
}

struct Worker {
    tx: mpsc::Sender<Command>,
    handle: JoinHandle<()>,
}

/// Per-destination outbound queues.
#[derive(Clone)]
pub struct FederationSender {
    destinations: Arc<RwLock<HashMap<String, Worker>>>,
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn OutboundStore>>,
    config: Arc<SenderConfig>,
}

impl FederationSender {
    pub fn new(transport: Arc<dyn Transport>, config: SenderConfig) -> Self {
        Self {
            destinations: Arc::new(RwLock::new(HashMap::new())),
            transport,
            store: None,
            config: Arc::new(config),
        }
    }

    /// Persist queues in `store` so undelivered events survive a restart.
    pub fn with_store(mut self, store: Arc<dyn OutboundStore>) -> Self {
        self.store = Some(store);
        self
    }

    async fn worker(&self, destination: &str) -> mpsc::Sender<Command> {
        {
            let destinations = self.destinations.read().await;
            if let Some(worker) = destinations.get(destination) {
                return worker.tx.clone();
            }
        }

        let mut destinations = self.destinations.write().await;
        if let Some(worker) = destinations.get(destination) {
            return worker.tx.clone();
        }

        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let task = DestinationTask::new(
            destination.to_owned(),
            self.transport.clone(),
            self.store.clone(),
            self.config.clone(),
        );
        let handle = tokio::spawn(task.run(rx));
        destinations.insert(destination.to_owned(), Worker { tx: tx.clone(), handle });
        info!(destination = %destination, "Federation sender started");
        tx
    }

    async fn existing(&self, destination: &str) -> Option<mpsc::Sender<Command>> {
        self.destinations.read().await.get(destination).map(|w| w.tx.clone())
    }

    /// Append `event` to `destination`'s queue, starting its worker if needed.
    /// Waits while the worker's channel is full.
    pub async fn enqueue(&self, destination: &str, event: Arc<Event>) {
        if let Some(store) = &self.store {
            if let Err(e) = store.push_outbound(destination, &event).await {
                error!(
                    destination = %destination,
                    event_id = %event.event_id,
                    error = %e,
                    "Could not persist outbound event; queued in memory only"
                );
            }
        }
        self.dispatch(destination, Command::Enqueue(event)).await;
    }

    async fn dispatch(&self, destination: &str, cmd: Command) {
        let tx = self.worker(destination).await;
        if let Err(mpsc::error::SendError(cmd)) = tx.send(cmd).await {
            // The worker was removed between lookup and send; start a new one.
            let tx = self.worker(destination).await;
            if tx.send(cmd).await.is_err() {
                error!(destination = %destination, "Federation sender worker is gone; event not queued");
            }
        }
    }

    /// Queue again every event the outbound store still owes. Call once at
    /// start, before new events are accepted. Returns how many were queued.
    pub async fn restore(&self) -> StoreResult<usize> {
        let Some(store) = &self.store else { return Ok(0) };
        let pending = store.pending_outbound().await?;
        let count = pending.len();
        for (destination, event) in pending {
            self.dispatch(&destination, Command::Enqueue(event)).await;
        }
        if count > 0 {
            info!(count, "Restored outbound queues");
        }
        Ok(count)
    }

    /// Drop every queued event of `room_id` bound for `destination`.
    pub async fn cancel_room(&self, destination: &str, room_id: &str) {
        if let Some(tx) = self.existing(destination).await {
            let _ = tx.send(Command::CancelRoom(room_id.to_owned())).await;
        }
    }

    /// Clear failure state for `destination`, e.g. after it sent us a
    /// transaction.
    pub async fn mark_reachable(&self, destination: &str) {
        if let Some(tx) = self.existing(destination).await {
            let _ = tx.send(Command::MarkReachable).await;
        }
    }

    /// Stop `destination`'s worker once any in-flight send has finished.
    /// Events still queued are discarded, persisted ones included, with a
    /// warning naming how many.
    pub async fn remove_destination(&self, destination: &str) {
        if !self.stop(destination, true).await {
            let Some(store) = &self.store else { return };
            match store.clear_outbound(destination).await {
                Ok(0) => {}
                Ok(discarded) => warn!(destination = %destination, discarded, "Discarded undelivered events"),
                Err(e) => error!(destination = %destination, error = %e, "Could not clear outbound queue"),
            }
        }
    }

    /// `false` when `destination` had no worker.
    async fn stop(&self, destination: &str, discard: bool) -> bool {
        let Some(worker) = self.destinations.write().await.remove(destination) else {
            return false;
        };
        let _ = worker.tx.send(Command::Stop { discard }).await;
        if let Err(e) = worker.handle.await {
            error!(destination = %destination, error = %e, "Federation sender worker panicked");
        }
        info!(destination = %destination, "Federation sender stopped");
        true
    }

    pub async fn status(&self, destination: &str) -> Option<DestinationStatus> {
        let tx = self.existing(destination).await?;
        let (reply, rx) = oneshot::channel();
        tx.send(Command::Status(reply)).await.ok()?;
        rx.await.ok()
    }

    pub async fn destinations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.destinations.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every worker. Undelivered events stay in the outbound store for
    /// [`FederationSender::restore`]; without a store they are lost and a
    /// warning says how many.
    pub async fn shutdown(&self) {
        for destination in self.destinations().await {
            self.stop(&destination, false).await;
        }
    }
}

#[async_trait]
impl OutboundSink for FederationSender {
    async fn enqueue(&self, destination: &str, event: Arc<Event>) {
        FederationSender::enqueue(self, destination, event).await;
    }

    async fn cancel_room(&self, destination: &str, room_id: &str) {
        FederationSender::cancel_room(self, destination, room_id).await;
    }
}

// ─── Worker ──────────────────────────────────────────────────────────────────

/// A batch that has been attempted at least once keeps its transaction id.
struct Batch {
    txn_id: String,
    events: Vec<Arc<Event>>,
}

impl Batch {
    fn new(events: Vec<Arc<Event>>) -> Self {
        Self { txn_id: Uuid::now_v7().simple().to_string(), events }
    }
}

struct DestinationTask {
    destination: String,
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn OutboundStore>>,
    config: Arc<SenderConfig>,
    queue: VecDeque<Arc<Event>>,
    in_flight: Option<Batch>,
    link: LinkState,
    failures: u32,
    /// Next send attempt (backing off) or probe (unreachable).
    wake_at: Instant,
}

enum Step {
    Continue,
    Stop,
}

impl DestinationTask {
    fn new(
        destination: String,
        transport: Arc<dyn Transport>,
        store: Option<Arc<dyn OutboundStore>>,
        config: Arc<SenderConfig>,
    ) -> Self {
        Self {
            destination,
            transport,
            store,
            config,
            queue: VecDeque::new(),
            in_flight: None,
            link: LinkState::Healthy,
            failures: 0,
            wake_at: Instant::now(),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        loop {
            // Apply everything already waiting before deciding what to do.
            loop {
                match rx.try_recv() {
                    Ok(cmd) => {
                        if let Step::Stop = self.handle(cmd).await {
                            return;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => return,
                }
            }

            if self.in_flight.is_none() && !self.queue.is_empty() {
                let take = self.config.max_pdus_per_transaction.max(1).min(self.queue.len());
                self.in_flight = Some(Batch::new(self.queue.drain(..take).collect()));
            }

            match (self.in_flight.is_some(), self.link) {
                (false, _) => {
                    let Some(cmd) = rx.recv().await else { return };
                    if let Step::Stop = self.handle(cmd).await {
                        return;
                    }
                }
                (true, LinkState::Healthy) => self.attempt().await,
                (true, state) => {
                    tokio::select! {
                        cmd = rx.recv() => {
                            let Some(cmd) = cmd else { return };
                            if let Step::Stop = self.handle(cmd).await {
                                return;
                            }
                        }
                        _ = sleep_until(self.wake_at) => match state {
                            LinkState::Unreachable => self.probe().await,
                            _ => self.attempt().await,
                        },
                    }
                }
            }
        }
    }

    async fn handle(&mut self, cmd: Command) -> Step {
        match cmd {
            Command::Enqueue(event) => self.queue.push_back(event),
            Command::CancelRoom(room_id) => {
                let dropped = self.cancel_room(&room_id);
                self.forget(&dropped).await;
            }
            Command::MarkReachable => {
                if self.link != LinkState::Healthy {
                    info!(destination = %self.destination, "Destination marked reachable");
                }
                self.reset();
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Stop { discard } => {
                self.stop(discard).await;
                return Step::Stop;
            }
        }
        Step::Continue
    }

    /// Remove `room_id`'s events from the queue and the in-flight batch.
    /// Returns the ids dropped.
    fn cancel_room(&mut self, room_id: &str) -> Vec<String> {
        let mut dropped: Vec<String> =
            self.queue.iter().filter(|ev| ev.room_id == room_id).map(|ev| ev.event_id.clone()).collect();
        self.queue.retain(|ev| ev.room_id != room_id);

        if let Some(batch) = self.in_flight.take() {
            let (gone, kept): (Vec<_>, Vec<_>) = batch.events.iter().cloned().partition(|ev| ev.room_id == room_id);
            dropped.extend(gone.iter().map(|ev| ev.event_id.clone()));
            self.in_flight = match kept.len() {
                0 => None,
                // Different contents need a different transaction id.
                n if n != batch.events.len() => Some(Batch::new(kept)),
                _ => Some(batch),
            };
        }
        if !dropped.is_empty() {
            debug!(destination = %self.destination, room_id = %room_id, dropped = dropped.len(), "Cancelled queued room events");
        }
        dropped
    }

    /// Remove delivered or cancelled events from the outbound store.
    async fn forget(&self, event_ids: &[String]) {
        let Some(store) = &self.store else { return };
        if event_ids.is_empty() {
            return;
        }
        if let Err(e) = store.remove_outbound(&self.destination, event_ids).await {
            warn!(destination = %self.destination, count = event_ids.len(), error = %e, "Could not clear sent events from the outbound store");
        }
    }

    async fn stop(&self, discard: bool) {
        let pending = self.status().queued;
        match &self.store {
            Some(store) if discard => match store.clear_outbound(&self.destination).await {
                Ok(rows) if pending > 0 || rows > 0 => {
                    warn!(destination = %self.destination, discarded = pending.max(rows as usize), "Discarded undelivered events");
                }
                Ok(_) => {}
                Err(e) => error!(destination = %self.destination, error = %e, "Could not clear outbound queue"),
            },
            Some(_) if pending > 0 => {
                info!(destination = %self.destination, pending, "Undelivered events kept for the next start");
            }
            None if pending > 0 => {
                warn!(destination = %self.destination, discarded = pending, "Discarded undelivered events");
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.link = LinkState::Healthy;
        self.wake_at = Instant::now();
    }

    fn status(&self) -> DestinationStatus {
        DestinationStatus {
            link: self.link,
            queued: self.queue.len() + self.in_flight.as_ref().map_or(0, |b| b.events.len()),
            consecutive_failures: self.failures,
        }
    }

    async fn attempt(&mut self) {
        let Some(batch) = self.in_flight.as_ref() else { return };
        let pdus = batch
            .events
            .iter()
            .filter_map(|ev| match serde_json::to_value(ev.as_ref()) {
                Ok(pdu) => Some(pdu),
                Err(e) => {
                    error!(event_id = %ev.event_id, error = %e, "Cannot serialise outbound event");
                    None
                }
            })
            .collect();
        let txn = Transaction::new(self.config.server_name.clone(), pdus);
        debug!(destination = %self.destination, txn_id = %batch.txn_id, pdus = txn.pdus.len(), "Sending transaction");

        match self.transport.send_transaction(&self.destination, &batch.txn_id, &txn).await {
            Ok(response) => {
                let sent: Vec<String> = batch.events.iter().map(|ev| ev.event_id.clone()).collect();
                for (event_id, result) in response.failures() {
                    warn!(
                        destination = %self.destination,
                        event_id = %event_id,
                        errcode = result.errcode.as_deref().unwrap_or_default(),
                        "Remote refused event"
                    );
                }
                self.in_flight = None;
                self.reset();
                self.forget(&sent).await;
            }
            Err(e) => {
                if !e.is_transient() {
                    error!(destination = %self.destination, txn_id = %batch.txn_id, error = %e, "Transaction failed for a non-network reason");
                }
                self.record_failure(&e.to_string())
            }
        }
    }

    fn record_failure(&mut self, error: &str) {
        self.failures += 1;
        if self.failures >= self.config.unreachable_threshold {
            if self.link != LinkState::Unreachable {
                warn!(destination = %self.destination, failures = self.failures, error = %error, "Destination unreachable");
            }
            self.link = LinkState::Unreachable;
            self.wake_at = Instant::now() + self.config.probe_interval;
        } else {
            let delay = self.config.backoff(self.failures);
            warn!(
                destination = %self.destination,
                failures = self.failures,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "Transaction failed"
            );
            self.link = LinkState::BackingOff;
            self.wake_at = Instant::now() + delay;
        }
    }

    async fn probe(&mut self) {
        match self.transport.probe(&self.destination).await {
            Ok(()) => {
                info!(destination = %self.destination, "Probe succeeded; resuming sends");
                self.reset();
            }
            Err(e) => {
                debug!(destination = %self.destination, error = %e, "Probe failed");
                self.wake_at = Instant::now() + self.config.probe_interval;
            }
        }
    }
}
