//! Federation wire types: transaction envelopes, per-PDU results, key
//! documents and the request/response bodies of the other S2S endpoints.

use std::collections::BTreeMap;

use chrono::Utc;
use hearth_common::{
    HearthError,
    canonical::{canonical_json, sha256_b64, strip_unhashed},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Transaction envelope ────────────────────────────────────────────────────

/// The body of `PUT /_hearth/federation/v1/send/{txnId}`.
///
/// PDUs stay raw JSON until ingress looks at them one by one, so a single bad
/// PDU does not fail the whole transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Originating server name.
    pub origin: String,
    /// Unix millisecond timestamp on the origin server.
    pub origin_server_ts: i64,
    #[serde(default)]
    pub pdus: Vec<Value>,
}

impl Transaction {
    pub fn new(origin: impl Into<String>, pdus: Vec<Value>) -> Self {
        Self { origin: origin.into(), origin_server_ts: Utc::now().timestamp_millis(), pdus }
    }
}

/// Per-PDU processing results, keyed by event id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub pdus: BTreeMap<String, PduResult>,
}

impl TransactionResponse {
    /// Ids the remote refused for a permanent reason.
    pub fn failures(&self) -> impl Iterator<Item = (&String, &PduResult)> {
        self.pdus.iter().filter(|(_, r)| !r.is_ok())
    }
}

/// `{}` on success, `{ "errcode": …, "error": … }` otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PduResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PduResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn err(errcode: &str, error: impl Into<String>) -> Self {
        Self { errcode: Some(errcode.to_owned()), error: Some(error.into()) }
    }

    pub fn is_ok(&self) -> bool {
        self.errcode.is_none()
    }
}

impl From<&HearthError> for PduResult {
    fn from(e: &HearthError) -> Self {
        Self::err(e.error_code(), e.to_string())
    }
}

/// Key a PDU is reported under: its declared `event_id`, or the content hash
/// when it has none.
pub fn pdu_key(pdu: &Value) -> String {
    if let Some(id) = pdu.get("event_id").and_then(Value::as_str) {
        return id.to_owned();
    }
    let mut hashed = pdu.clone();
    strip_unhashed(&mut hashed);
    format!("${}", sha256_b64(canonical_json(&hashed).as_bytes()))
}

// ─── Server keys ─────────────────────────────────────────────────────────────

/// A single public verify key entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyKey {
    /// Base64url-encoded Ed25519 public key bytes.
    pub key: String,
}

/// The self-signed key document served at `/_hearth/key/v2/server`.
///
/// Remote servers cache this document to verify event and request signatures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerKeyDocument {
    pub server_name: String,
    pub verify_keys: BTreeMap<String, VerifyKey>,
    /// Unix millisecond timestamp after which this document should be re-fetched.
    pub valid_until_ts: i64,
    #[serde(default)]
    pub signatures: BTreeMap<String, BTreeMap<String, String>>,
}

impl ServerKeyDocument {
    /// Canonical JSON of the document without its signatures.
    pub fn signing_json(&self) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("signatures");
        }
        Ok(canonical_json(&value))
    }
}

// ─── Other endpoints ─────────────────────────────────────────────────────────

/// Body of `POST /_hearth/federation/v1/get_missing_events/{roomId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingEventsRequest {
    #[serde(default)]
    pub earliest_events: Vec<String>,
    pub latest_events: Vec<String>,
    #[serde(default = "default_missing_limit")]
    pub limit: usize,
}

fn default_missing_limit() -> usize {
    10
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissingEventsResponse {
    /// Oldest first.
    pub events: Vec<Value>,
}

/// Response of `GET /_hearth/federation/v1/state/{roomId}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateResponse {
    pub pdus: Vec<Value>,
}

/// Response of `GET /_hearth/federation/v1/version`, also used as the probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionResponse {
    pub server: ServerVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerVersion {
    pub name: String,
    pub version: String,
}

impl VersionResponse {
    pub fn current() -> Self {
        Self {
            server: ServerVersion { name: "Hearth".into(), version: env!("CARGO_PKG_VERSION").into() },
        }
    }
}

/// Response shape for `/.well-known/hearth/server`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WellKnownServer {
    /// The delegated server name (may differ from the queried hostname for delegation).
    #[serde(rename = "h.server")]
    pub server: String,
}
