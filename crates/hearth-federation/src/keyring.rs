//! Public keys of remote servers.
//!
//! Lookup order: this server's own key, keys pinned by configuration or tests,
//! cached key documents, then a fresh fetch of `/_hearth/key/v2/server` from
//! the server itself. Fetched documents must carry a valid self-signature and
//! are cached until their `valid_until_ts`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use hearth_common::Event;
use tracing::{debug, warn};

use crate::{
    client::Transport,
    error::FederationError,
    keys::{ServerKeyPair, verify_key_document},
    signatures::verify_event_signature,
};

/// Resolves the public key a server signed with.
#[async_trait]
pub trait KeyLookup: Send + Sync {
    /// Base64url public key `server` used as `key_id`, valid at `valid_at`
    /// (unix ms).
    async fn get_signing_key(&self, server: &str, key_id: &str, valid_at: i64) -> Result<String, FederationError>;
}

/// Check every signature the event's origin server put on it. At least one
/// is required.
pub async fn verify_event(keys: &dyn KeyLookup, event: &Event) -> Result<(), FederationError> {
    let origin = event.origin().ok_or(FederationError::InvalidSignature)?;
    let sigs = event.signatures.get(origin).filter(|s| !s.is_empty()).ok_or(FederationError::InvalidSignature)?;
    for key_id in sigs.keys() {
        let pubkey = keys.get_signing_key(origin, key_id, event.origin_server_ts).await?;
        verify_event_signature(event, origin, key_id, &pubkey)?;
    }
    Ok(())
}

struct CachedKeys {
    keys: BTreeMap<String, String>,
    valid_until_ts: i64,
}

pub struct KeyRing {
    server_name: String,
    own: Arc<ServerKeyPair>,
    pinned: RwLock<HashMap<(String, String), String>>,
    cache: RwLock<HashMap<String, CachedKeys>>,
    transport: Option<Arc<dyn Transport>>,
}

impl KeyRing {
    pub fn new(server_name: impl Into<String>, own: Arc<ServerKeyPair>) -> Self {
        Self {
            server_name: server_name.into(),
            own,
            pinned: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            transport: None,
        }
    }

    /// Fetch unknown keys from their servers over `transport`.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Trust `key` for `server` / `key_id` without fetching.
    pub fn pin(&self, server: &str, key_id: &str, key: impl Into<String>) {
        self.pinned
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((server.to_owned(), key_id.to_owned()), key.into());
    }

    fn cached(&self, server: &str, key_id: &str, valid_at: i64) -> Option<String> {
        let now = Utc::now().timestamp_millis();
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        let entry = cache.get(server)?;
        if entry.valid_until_ts < now.max(valid_at) {
            return None;
        }
        entry.keys.get(key_id).cloned()
    }

    async fn fetch(&self, server: &str) -> Result<(), FederationError> {
        let transport = self.transport.as_ref().ok_or_else(|| FederationError::KeyNotFound {
            server: server.to_owned(),
            key_id: "*".into(),
        })?;
        let doc = transport.fetch_server_keys(server).await?;
        if doc.server_name != server {
            warn!(server = %server, claimed = %doc.server_name, "Key document names another server");
            return Err(FederationError::InvalidSignature);
        }
        verify_key_document(&doc)?;
        debug!(server = %server, keys = doc.verify_keys.len(), "Fetched server keys");

        let keys = doc.verify_keys.into_iter().map(|(id, vk)| (id, vk.key)).collect();
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(server.to_owned(), CachedKeys { keys, valid_until_ts: doc.valid_until_ts });
        Ok(())
    }
}

#[async_trait]
impl KeyLookup for KeyRing {
    async fn get_signing_key(&self, server: &str, key_id: &str, valid_at: i64) -> Result<String, FederationError> {
        if server == self.server_name && key_id == self.own.key_id {
            return Ok(self.own.public_key_base64());
        }
        let pinned = self
            .pinned
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(server.to_owned(), key_id.to_owned()))
            .cloned();
        if let Some(key) = pinned {
            return Ok(key);
        }
        if let Some(key) = self.cached(server, key_id, valid_at) {
            return Ok(key);
        }

        self.fetch(server).await?;
        self.cached(server, key_id, valid_at).ok_or_else(|| FederationError::KeyNotFound {
            server: server.to_owned(),
            key_id: key_id.to_owned(),
        })
    }
}
