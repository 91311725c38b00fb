//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let app_config = load()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Build a fresh configuration from defaults, `config.toml` and `HEARTH__*`
/// environment variables without touching the global.
pub fn load() -> Result<AppConfig, config::ConfigError> {
    let cfg = with_defaults(config::Config::builder())?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (HEARTH__SERVER__NAME, HEARTH__DATABASE__URL, etc.)
        .add_source(
            config::Environment::with_prefix("HEARTH")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    cfg.try_deserialize()
}

fn with_defaults(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
    builder
        .set_default("server.name", "localhost")?
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.federation_port", 8448)?
        .set_default("database.max_connections", 20)?
        .set_default("database.min_connections", 2)?
        .set_default("federation.max_pdus_per_transaction", 50)?
        .set_default("federation.queue_capacity", 1024)?
        .set_default("federation.backoff_base_ms", 500)?
        .set_default("federation.backoff_max_ms", 3_600_000)? // 1 hour
        .set_default("federation.unreachable_threshold", 10)?
        .set_default("federation.probe_interval_ms", 300_000)? // 5 min
        .set_default("federation.request_timeout_secs", 30)?
        .set_default("federation.relay_remote_events", true)?
        .set_default("federation.txn_cache_size", 1024)?
        .set_default("rooms.default_room_version", "2")?
        .set_default("rooms.lock_shards", 64)?
        .set_default("rooms.max_backfill_depth", 8)?
        .set_default("rooms.max_delta_chain", 64)?
        .set_default("rooms.snapshot_cache_size", 4096)?
        .set_default("rooms.max_outliers_per_room", 1000)?
        .set_default("rooms.submission_concurrency", 16)
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationSettings,
    pub rooms: RoomSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public server name used for federation (e.g. "hearth.example.com").
    /// Maps to the `HEARTH__SERVER__NAME` env var or `server.name` in config.toml.
    pub name: String,
    pub host: String,
    /// Port used for server-to-server federation (default 8448).
    pub federation_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL: optional; omit to run with in-memory stores.
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FederationSettings {
    /// Upper bound on PDUs per transaction, both directions.
    pub max_pdus_per_transaction: usize,
    /// Capacity of each destination's command channel.
    pub queue_capacity: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Consecutive failures before a destination is marked unreachable.
    pub unreachable_threshold: u32,
    pub probe_interval_ms: u64,
    pub request_timeout_secs: u64,
    /// Relay events received straight from their origin to servers that
    /// joined on branches the origin had not seen.
    pub relay_remote_events: bool,
    /// Remembered `(origin, txn_id)` responses for replayed transactions.
    pub txn_cache_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoomSettings {
    pub default_room_version: String,
    pub lock_shards: usize,
    pub max_backfill_depth: usize,
    /// Snapshots deeper than this many deltas are stored in full.
    pub max_delta_chain: u32,
    pub snapshot_cache_size: usize,
    /// Outliers kept per room before the oldest is forgotten.
    pub max_outliers_per_room: usize,
    /// Submissions processed at once, local clients and federation ingress together.
    pub submission_concurrency: usize,
}
