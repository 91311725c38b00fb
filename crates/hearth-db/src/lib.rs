//! # hearth-db
//!
//! Storage layer for Hearth. Two stores share one backend:
//! - **Event Store**: content-addressed, append-only signed events
//! - **State Store**: event metadata (status, snapshot refs), delta-encoded
//!   state snapshots, forward extremities, room records
//! - **Outbound Queue**: events owed to other servers until acknowledged
//!
//! Backends: **PostgreSQL** (durable, `sqlx`) and **memory** (tests and
//! `--ephemeral` runs).

pub mod error;
pub mod event_store;
pub mod memory;
pub mod model;
pub mod outbound_store;
pub mod postgres;
pub mod state_store;

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;

pub use error::{StoreError, StoreResult};
pub use event_store::{EventStore, EventStream};
pub use memory::MemoryStore;
pub use model::{EventMeta, EventStatus, PutOutcome, RoomRecord, SnapshotId, StateSnapshot, StoredEvent};
pub use outbound_store::OutboundStore;
pub use postgres::PgStore;
pub use state_store::StateStore;

/// Shared database state passed to the server wiring.
#[derive(Clone)]
pub struct Database {
    pub pg: PgPool,
}

impl Database {
    /// Connect to PostgreSQL.
    pub async fn connect(config: &hearth_common::config::AppConfig) -> Result<Self> {
        let url = config
            .database
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("database.url is not set"))?;

        tracing::info!("Connecting to PostgreSQL...");
        let pg = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .min_connections(config.database.min_connections)
            .connect(url)
            .await?;
        tracing::info!("Connected to PostgreSQL");

        Ok(Self { pg })
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pg).await?;
        tracing::info!("Migrations complete");
        Ok(())
    }
}

/// The stores behind trait objects, backed by the same backend.
#[derive(Clone)]
pub struct Stores {
    pub events: Arc<dyn EventStore>,
    pub state: Arc<dyn StateStore>,
    pub outbound: Arc<dyn OutboundStore>,
}

impl Stores {
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self { events: store.clone(), state: store.clone(), outbound: store }
    }

    pub fn postgres(db: &Database) -> Self {
        let store = Arc::new(PgStore::new(db.pg.clone()));
        Self { events: store.clone(), state: store.clone(), outbound: store }
    }
}
