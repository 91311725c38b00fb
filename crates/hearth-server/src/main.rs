//! # Hearth Server
//!
//! Main binary: loads configuration, opens the stores, loads the signing key
//! and serves the federation API on the federation port.
//!
//! Everything runs in one process: the room DAG, one sender worker per
//! remote destination, and the inbound transaction handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use hearth_api::{AppState, build_router};
use hearth_db::{Database, Stores};
use hearth_federation::{
    FederationBackfill, FederationClient, FederationIngress, FederationSender, IngressConfig, KeyManager, KeyRing,
    SenderConfig, ServerKeyPair, ServerSigner, Transport,
};
use hearth_rooms::{DagConfig, RoomDag};

/// Events requested per backfill call.
const BACKFILL_LIMIT: usize = 100;

#[derive(Debug, Parser)]
#[command(name = "hearth", version, about = "Federated room-event homeserver")]
struct Cli {
    /// Keep everything in memory and use a throwaway signing key.
    #[arg(long, env = "HEARTH_EPHEMERAL")]
    ephemeral: bool,

    /// Emit logs as JSON lines.
    #[arg(long, env = "HEARTH_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = hearth_common::config::init()?;

    // Initialize tracing (structured logging)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "hearth=debug,tower_http=debug".into());
    if cli.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).with_target(true).with_thread_ids(true).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_thread_ids(true).init();
    }

    tracing::info!(server_name = %config.server.name, "Starting Hearth v{}", env!("CARGO_PKG_VERSION"));

    // === Stores and signing key ===
    let (stores, keys, db) = match &config.database.url {
        Some(_) if !cli.ephemeral => {
            let db = Database::connect(config).await?;
            db.migrate().await?;
            // Load the active Ed25519 key from DB, or generate + persist a new one on first run.
            let keys = KeyManager::new(db.pg.clone()).load_or_generate().await?;
            (Stores::postgres(&db), keys, Some(db))
        }
        _ => {
            tracing::warn!("Running with in-memory stores; nothing survives a restart");
            (Stores::memory(), Arc::new(ServerKeyPair::generate()), None)
        }
    };
    tracing::info!(key_id = %keys.key_id, "Federation signing key ready");

    // === Federation plumbing ===
    let client: Arc<dyn Transport> = Arc::new(FederationClient::new(
        &config.server.name,
        keys.clone(),
        Duration::from_secs(config.federation.request_timeout_secs),
    )?);
    let key_ring = Arc::new(KeyRing::new(&config.server.name, keys.clone()).with_transport(client.clone()));
    let sender = FederationSender::new(client.clone(), SenderConfig::from(config)).with_store(stores.outbound.clone());
    sender.restore().await?;

    // === Room DAG ===
    let dag = Arc::new(
        RoomDag::new(stores, DagConfig::from(config))
            .with_sink(Arc::new(sender.clone()))
            .with_backfill(Arc::new(FederationBackfill::new(client, key_ring.clone(), BACKFILL_LIMIT)))
            .with_signer(Arc::new(ServerSigner::new(&config.server.name, keys.clone()))),
    );

    let ingress = Arc::new(
        FederationIngress::new(dag.clone(), key_ring, IngressConfig::from(config)).with_sender(sender.clone()),
    );

    // === HTTP ===
    let mut state = AppState::new(&config.server.name, dag, ingress, keys)
        .with_delegation(format!("{}:{}", config.server.name, config.server.federation_port));
    if let Some(db) = db {
        state = state.with_database(db);
    }
    let router = build_router(state);
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.federation_port);

    tracing::info!("Federation API listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await?;

    tracing::info!("Stopping federation senders");
    sender.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
