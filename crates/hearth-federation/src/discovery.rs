//! Server discovery: turns a server name into the base URL its federation API
//! is served from.
//!
//! 1. A name with an explicit port (`b.test:8448`, `[::1]:8448`) is used as is.
//! 2. Otherwise `https://<name>/.well-known/hearth/server` may delegate to
//!    another `host[:port]`.
//! 3. Failing that, `https://<name>:8448`.
//!
//! Delegations are remembered for a day, fallbacks for an hour so a newly
//! published well-known file is picked up reasonably soon.

use std::{collections::HashMap, sync::Arc, time::Duration};

use hearth_common::ids;
use tokio::{sync::RwLock, time::Instant};
use tracing::{debug, warn};

use crate::{error::FederationError, types::WellKnownServer};

pub const DEFAULT_FEDERATION_PORT: u16 = 8448;

const DELEGATION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const FALLBACK_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolution {
    ExplicitPort,
    Delegated(String),
    Fallback,
}

#[derive(Debug)]
struct Resolved {
    base_url: String,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
pub struct DiscoveryCache {
    entries: Arc<RwLock<HashMap<String, Resolved>>>,
    http: reqwest::Client,
}

impl DiscoveryCache {
    pub fn new() -> Result<Self, FederationError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .user_agent(concat!("Hearth-Federation/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { entries: Arc::new(RwLock::new(HashMap::new())), http })
    }

    /// Base URL (`https://host:port`) for `server_name`.
    pub async fn resolve(&self, server_name: &str) -> Result<String, FederationError> {
        if let Some(entry) = self.entries.read().await.get(server_name) {
            if entry.expires_at > Instant::now() {
                return Ok(entry.base_url.clone());
            }
        }

        let resolution = if has_explicit_port(server_name) {
            Resolution::ExplicitPort
        } else {
            match self.well_known(server_name).await {
                Ok(Some(delegated)) => Resolution::Delegated(delegated),
                Ok(None) => Resolution::Fallback,
                Err(e) => {
                    warn!(server = %server_name, error = %e, "Ignoring well-known delegation");
                    Resolution::Fallback
                }
            }
        };

        let (base_url, ttl) = match &resolution {
            Resolution::ExplicitPort => (base_url_for(server_name), DELEGATION_TTL),
            Resolution::Delegated(target) => (base_url_for(target), DELEGATION_TTL),
            Resolution::Fallback => (base_url_for(server_name), FALLBACK_TTL),
        };
        debug!(server = %server_name, base_url = %base_url, via = ?resolution, "Resolved federation endpoint");

        self.entries
            .write()
            .await
            .insert(server_name.to_owned(), Resolved { base_url: base_url.clone(), expires_at: Instant::now() + ttl });
        Ok(base_url)
    }

    /// Forget a server's resolution, e.g. after a connection failure.
    pub async fn invalidate(&self, server_name: &str) {
        self.entries.write().await.remove(server_name);
    }

    /// `Ok(None)` when the server publishes no delegation; an error when it
    /// publishes one that cannot be used.
    async fn well_known(&self, server_name: &str) -> Result<Option<String>, FederationError> {
        let url = format!("https://{server_name}/.well-known/hearth/server");
        let resp = match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            _ => return Ok(None),
        };
        let body: WellKnownServer =
            resp.json().await.map_err(|_| FederationError::BadWellKnown(server_name.to_owned()))?;
        parse_delegation(server_name, body)
    }
}

fn parse_delegation(server_name: &str, body: WellKnownServer) -> Result<Option<String>, FederationError> {
    let target = body.server.trim();
    if !ids::is_valid_server_name(target) {
        return Err(FederationError::BadWellKnown(server_name.to_owned()));
    }
    Ok(Some(target.to_owned()))
}

fn base_url_for(server: &str) -> String {
    if has_explicit_port(server) {
        format!("https://{server}")
    } else {
        format!("https://{server}:{DEFAULT_FEDERATION_PORT}")
    }
}

fn has_explicit_port(server_name: &str) -> bool {
    if let Some(rest) = server_name.strip_prefix('[') {
        return rest.contains("]:");
    }
    // A bare IPv6 address has several colons and no port.
    server_name.matches(':').count() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_ports_skip_delegation() {
        assert!(has_explicit_port("hearth.example.com:8448"));
        assert!(has_explicit_port("[::1]:8448"));
        assert!(!has_explicit_port("hearth.example.com"));
        assert!(!has_explicit_port("::1"));
        assert!(!has_explicit_port("[::1]"));
    }

    #[test]
    fn missing_port_defaults_to_federation_port() {
        assert_eq!(base_url_for("b.test"), "https://b.test:8448");
        assert_eq!(base_url_for("b.test:443"), "https://b.test:443");
    }

    #[test]
    fn delegation_targets_are_validated() {
        let ok = WellKnownServer { server: " fed.b.test:443 ".into() };
        assert_eq!(parse_delegation("b.test", ok).unwrap().as_deref(), Some("fed.b.test:443"));

        let bad = WellKnownServer { server: "https://fed.b.test/".into() };
        assert!(matches!(parse_delegation("b.test", bad), Err(FederationError::BadWellKnown(s)) if s == "b.test"));
    }

    #[tokio::test]
    async fn explicit_ports_resolve_without_network() {
        let cache = DiscoveryCache::new().unwrap();
        assert_eq!(cache.resolve("b.test:8448").await.unwrap(), "https://b.test:8448");
        cache.invalidate("b.test:8448").await;
        assert!(cache.entries.read().await.is_empty());
    }
}
