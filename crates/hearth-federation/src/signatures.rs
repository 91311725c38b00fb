//! Event signatures and federation request signing.
//!
//! Events are signed over the same canonical JSON their id is hashed from, so
//! a signature covers exactly the bytes that name the event. The signature is
//! stored under `signatures.<server_name>.<key_id>`.
//!
//! All server-to-server HTTP requests carry a signed Authorization header:
//!
//! ```text
//! Authorization: HearthFederation origin="a.example.com",
//!                key="ed25519:3f9a2c01b7e4",
//!                sig="<base64url-encoded-signature>"
//! ```
//!
//! The signed content is the canonical JSON of a request object:
//!
//! ```json
//! {
//!   "method":      "PUT",
//!   "uri":         "/_hearth/federation/v1/send/txnABC",
//!   "origin":      "a.example.com",
//!   "destination": "b.example.com",
//!   "content":     { ... }   // only present for PUT/POST
//! }
//! ```

use std::sync::Arc;

use hearth_common::{Event, canonical::canonical_json};
use hearth_rooms::EventSigner;
use serde_json::{Map, Value};

use crate::{
    error::FederationError,
    keys::{ServerKeyPair, verify_signature},
};

// ─── Events ──────────────────────────────────────────────────────────────────

/// Add this server's signature to `event`.
pub fn sign_event(kp: &ServerKeyPair, server_name: &str, event: &mut Event) -> Result<(), FederationError> {
    let sig = kp.sign_bytes(event.signing_json()?.as_bytes());
    event.signatures.entry(server_name.to_owned()).or_default().insert(kp.key_id.clone(), sig);
    Ok(())
}

/// Check the signature `server_name` made with `key_id`.
pub fn verify_event_signature(
    event: &Event,
    server_name: &str,
    key_id: &str,
    pubkey_base64: &str,
) -> Result<(), FederationError> {
    let sig = event
        .signatures
        .get(server_name)
        .and_then(|s| s.get(key_id))
        .ok_or(FederationError::InvalidSignature)?;
    verify_signature(pubkey_base64, sig, event.signing_json()?.as_bytes())
}

/// Signs the events this server builds.
pub struct ServerSigner {
    server_name: String,
    keys: Arc<ServerKeyPair>,
}

impl ServerSigner {
    pub fn new(server_name: impl Into<String>, keys: Arc<ServerKeyPair>) -> Self {
        Self { server_name: server_name.into(), keys }
    }
}

impl EventSigner for ServerSigner {
    fn sign_event(&self, event: &mut Event) -> anyhow::Result<()> {
        sign_event(&self.keys, &self.server_name, event)?;
        Ok(())
    }
}

// ─── Requests ────────────────────────────────────────────────────────────────

/// A federation request authorization, as carried in the `Authorization`
/// header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FedAuth {
    pub origin: String,
    pub key_id: String,
    pub sig: String,
}

impl FedAuth {
    /// Build the `Authorization: HearthFederation …` header value.
    pub fn to_header(&self) -> String {
        format!(r#"HearthFederation origin="{}",key="{}",sig="{}""#, self.origin, self.key_id, self.sig)
    }

    /// Parse a `HearthFederation` Authorization header.
    pub fn parse(header: &str) -> Result<Self, FederationError> {
        let header = header.strip_prefix("HearthFederation ").ok_or_else(|| {
            FederationError::MalformedAuthHeader("must start with 'HearthFederation '".into())
        })?;

        let mut origin = None;
        let mut key = None;
        let mut sig = None;

        for part in header.split(',') {
            let Some((name, value)) = part.trim().split_once('=') else { continue };
            let value = value.trim_matches('"').to_owned();
            match name {
                "origin" => origin = Some(value),
                "key" => key = Some(value),
                "sig" => sig = Some(value),
                _ => {}
            }
        }

        Ok(Self {
            origin: origin.ok_or_else(|| FederationError::MalformedAuthHeader("missing 'origin'".into()))?,
            key_id: key.ok_or_else(|| FederationError::MalformedAuthHeader("missing 'key'".into()))?,
            sig: sig.ok_or_else(|| FederationError::MalformedAuthHeader("missing 'sig'".into()))?,
        })
    }
}

/// Sign an outbound federation request.
///
/// * `method`: HTTP method, uppercase (e.g. `"PUT"`)
/// * `uri`: request path + query (e.g. `"/_hearth/federation/v1/send/txn1"`)
/// * `content`: request body (`None` for GET requests)
pub fn sign_request(
    kp: &ServerKeyPair,
    origin: &str,
    destination: &str,
    method: &str,
    uri: &str,
    content: Option<&Value>,
) -> FedAuth {
    let signed = request_signing_json(origin, destination, method, uri, content);
    FedAuth { origin: origin.to_owned(), key_id: kp.key_id.clone(), sig: kp.sign_bytes(signed.as_bytes()) }
}

/// Verify an inbound request against the origin's public key.
///
/// `destination` is this server's name: it must match what the sender signed.
pub fn verify_request(
    auth: &FedAuth,
    destination: &str,
    method: &str,
    uri: &str,
    content: Option<&Value>,
    pubkey_base64: &str,
) -> Result<(), FederationError> {
    let signed = request_signing_json(&auth.origin, destination, method, uri, content);
    verify_signature(pubkey_base64, &auth.sig, signed.as_bytes())
}

fn request_signing_json(
    origin: &str,
    destination: &str,
    method: &str,
    uri: &str,
    content: Option<&Value>,
) -> String {
    let mut map = Map::new();
    map.insert("method".into(), Value::String(method.to_uppercase()));
    map.insert("uri".into(), Value::String(uri.to_owned()));
    map.insert("origin".into(), Value::String(origin.to_owned()));
    map.insert("destination".into(), Value::String(destination.to_owned()));
    if let Some(body) = content {
        map.insert("content".into(), body.clone());
    }
    canonical_json(&Value::Object(map))
}
