//! Health check endpoint for load balancers and container health checks.

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_name: String,
    version: &'static str,
    uptime_secs: u64,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    // Check database connectivity
    let db_ok = match &state.db {
        Some(db) => hearth_db::postgres::health_check(&db.pg).await,
        None => true,
    };

    Json(HealthResponse {
        status: if db_ok { "healthy" } else { "degraded" },
        server_name: state.server_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}
