//! Ed25519 server signing keys.
//!
//! Each Hearth server holds an Ed25519 key pair. It signs every event the
//! server creates, every outbound federation request and the server's own key
//! document. Remote servers verify these signatures with the public key
//! fetched from `/_hearth/key/v2/server`.
//!
//! # Key IDs
//! `ed25519:<fingerprint>`, the fingerprint being the first 6 bytes of the
//! public key, hex-encoded. Example: `ed25519:3f9a2c01b7e4`.

use std::collections::BTreeMap;

use base64::Engine as _;
use chrono::{Duration, Utc};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;

use crate::{
    error::FederationError,
    types::{ServerKeyDocument, VerifyKey},
};

/// How long a served key document stays valid for remote caches.
pub const KEY_DOCUMENT_TTL_HOURS: i64 = 24;

// ─── Key pair ────────────────────────────────────────────────────────────────

/// An Ed25519 signing key pair for this server.
pub struct ServerKeyPair {
    /// Key ID in the format `ed25519:<12-char-hex>`.
    pub key_id: String,
    signing_key: SigningKey,
}

impl std::fmt::Debug for ServerKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKeyPair").field("key_id", &self.key_id).finish_non_exhaustive()
    }
}

impl ServerKeyPair {
    /// Generate a brand-new random Ed25519 key pair.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Reconstruct a key pair from its raw 32-byte seed (as stored in the DB).
    pub fn from_seed(seed: &[u8]) -> Result<Self, FederationError> {
        let bytes: [u8; 32] = seed
            .try_into()
            .map_err(|_| FederationError::KeyLoad("seed must be exactly 32 bytes".into()))?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&bytes)))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let key_id = derive_key_id(signing_key.verifying_key().as_bytes());
        Self { key_id, signing_key }
    }

    /// The 32-byte seed, for persistence.
    pub fn seed_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// The public key as unpadded base64url.
    pub fn public_key_base64(&self) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(self.verifying_key().as_bytes())
    }

    /// Sign arbitrary bytes and return the base64url-encoded signature.
    pub fn sign_bytes(&self, bytes: &[u8]) -> String {
        let sig = self.signing_key.sign(bytes);
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(sig.to_bytes())
    }

    /// Build and self-sign the document served at `/_hearth/key/v2/server`.
    pub fn to_key_document(&self, server_name: &str) -> Result<ServerKeyDocument, FederationError> {
        let mut doc = ServerKeyDocument {
            server_name: server_name.to_owned(),
            verify_keys: BTreeMap::from([(
                self.key_id.clone(),
                VerifyKey { key: self.public_key_base64() },
            )]),
            valid_until_ts: (Utc::now() + Duration::hours(KEY_DOCUMENT_TTL_HOURS)).timestamp_millis(),
            signatures: BTreeMap::new(),
        };
        let sig = self.sign_bytes(doc.signing_json()?.as_bytes());
        doc.signatures
            .entry(server_name.to_owned())
            .or_default()
            .insert(self.key_id.clone(), sig);
        Ok(doc)
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn derive_key_id(pubkey_bytes: &[u8]) -> String {
    format!("ed25519:{}", hex::encode(&pubkey_bytes[..6]))
}

/// Verify an Ed25519 signature.
///
/// * `pubkey_base64`: base64url-encoded 32-byte verifying key
/// * `sig_base64`: base64url-encoded 64-byte signature
/// * `message`: original signed bytes
pub fn verify_signature(pubkey_base64: &str, sig_base64: &str, message: &[u8]) -> Result<(), FederationError> {
    use ed25519_dalek::Verifier;

    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let pubkey_bytes = engine.decode(pubkey_base64).map_err(|_| FederationError::InvalidSignature)?;
    let sig_bytes = engine.decode(sig_base64).map_err(|_| FederationError::InvalidSignature)?;

    let verifying_key = VerifyingKey::from_bytes(
        pubkey_bytes.as_slice().try_into().map_err(|_| FederationError::InvalidSignature)?,
    )
    .map_err(|_| FederationError::InvalidSignature)?;

    let signature = ed25519_dalek::Signature::from_bytes(
        sig_bytes.as_slice().try_into().map_err(|_| FederationError::InvalidSignature)?,
    );

    verifying_key.verify(message, &signature).map_err(|_| FederationError::InvalidSignature)
}

/// Check a fetched key document's self-signature against the keys it lists.
pub fn verify_key_document(doc: &ServerKeyDocument) -> Result<(), FederationError> {
    let sigs = doc.signatures.get(&doc.server_name).ok_or(FederationError::InvalidSignature)?;
    let signed = doc.signing_json()?;
    let mut verified = false;
    for (key_id, sig) in sigs {
        if let Some(vk) = doc.verify_keys.get(key_id) {
            verify_signature(&vk.key, sig, signed.as_bytes())?;
            verified = true;
        }
    }
    if verified { Ok(()) } else { Err(FederationError::InvalidSignature) }
}
