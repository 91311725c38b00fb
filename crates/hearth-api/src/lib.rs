//! # hearth-api
//!
//! The federation HTTP surface. Every route lives outside any `/api` prefix
//! so paths match what [`hearth_federation::FederationClient`] requests.

pub mod middleware;
pub mod routes;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{Router, extract::DefaultBodyLimit};
use hearth_db::Database;
use hearth_federation::{FederationIngress, ServerKeyPair};
use hearth_rooms::RoomDag;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Largest accepted request body. A full transaction of signed PDUs fits
/// comfortably.
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Shared application state passed to all route handlers.
pub struct AppState {
    pub server_name: String,
    /// `host:port` advertised at `/.well-known/hearth/server`.
    pub delegated_server: String,
    pub dag: Arc<RoomDag>,
    pub ingress: Arc<FederationIngress>,
    pub keys: Arc<ServerKeyPair>,
    /// Present when running on PostgreSQL; checked by `/health`.
    pub db: Option<Database>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        server_name: impl Into<String>,
        dag: Arc<RoomDag>,
        ingress: Arc<FederationIngress>,
        keys: Arc<ServerKeyPair>,
    ) -> Self {
        let server_name = server_name.into();
        Self {
            delegated_server: server_name.clone(),
            server_name,
            dag,
            ingress,
            keys,
            db: None,
            started_at: Instant::now(),
        }
    }

    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_delegation(mut self, delegated_server: impl Into<String>) -> Self {
        self.delegated_server = delegated_server.into();
        self
    }
}

/// Build the complete federation router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .merge(routes::health::router())
        .merge(routes::federation::router(state.clone()))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TimeoutLayer::new(Duration::from_secs(60)))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
