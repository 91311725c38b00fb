//! # hearth-federation
//!
//! Server-to-server layer for Hearth: signed transactions in and out of the
//! room DAG.
//!
//! ## Architecture
//!
//! ```text
//!  a.example.com                                   b.example.com
//!       │                                               │
//!  RoomDag ──► FederationSender ── PUT /send/{txnId} ──► FederationIngress ──► RoomDag
//!       │      (worker per destination)                 │  (hash, signature, auth)
//!       ◄──── POST /get_missing_events ◄── FederationBackfill
//! ```
//!
//! ## Key concepts
//!
//! - **Server keys** (`keys.rs`, `key_manager.rs`): each server holds an
//!   Ed25519 key pair, persisted in `federation_keys`, advertised via
//!   `/_hearth/key/v2/server`.
//! - **Signatures** (`signatures.rs`): events are signed over their canonical
//!   JSON; requests carry a `HearthFederation` Authorization header.
//! - **Key ring** (`keyring.rs`): resolves and caches remote servers' keys.
//! - **Client** (`client.rs`, `discovery.rs`): the [`Transport`] used for
//!   every outbound call, over HTTPS.
//! - **Ingress** (`ingress.rs`): per-PDU verification and submission.
//! - **Sender** (`sender.rs`): ordered, batched, retried delivery.
//! - **Backfill** (`backfill.rs`): fills DAG gaps from servers in the room.

pub mod backfill;
pub mod client;
pub mod discovery;
pub mod error;
pub mod ingress;
pub mod key_manager;
pub mod keyring;
pub mod keys;
pub mod sender;
pub mod signatures;
pub mod types;

pub use backfill::FederationBackfill;
pub use client::{FederationClient, Transport};
pub use error::FederationError;
pub use ingress::{FederationIngress, IngressConfig};
pub use key_manager::KeyManager;
pub use keyring::{KeyLookup, KeyRing};
pub use keys::ServerKeyPair;
pub use sender::{DestinationStatus, FederationSender, LinkState, SenderConfig};
pub use signatures::ServerSigner;
pub use types::{PduResult, Transaction, TransactionResponse};
