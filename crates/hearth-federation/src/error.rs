//! Federation-specific error types.

use hearth_common::HearthError;
use thiserror::Error;

/// Errors that can occur in federation operations.
#[derive(Debug, Error)]
pub enum FederationError {
    // ── Key management ──────────────────────────────────────────────────────

    #[error("No signing key '{key_id}' known for server '{server}'")]
    KeyNotFound { server: String, key_id: String },

    #[error("Failed to load signing key from storage: {0}")]
    KeyLoad(String),

    // ── Signature verification ───────────────────────────────────────────────

    #[error("Missing Authorization header on federated request")]
    MissingAuthHeader,

    #[error("Malformed Authorization header: {0}")]
    MalformedAuthHeader(String),

    #[error("Signature verification failed")]
    InvalidSignature,

    #[error("Event '{declared}' does not match its content hash '{computed}'")]
    HashMismatch { declared: String, computed: String },

    // ── Transactions ────────────────────────────────────────────────────────

    #[error("Transaction carries {count} PDUs, limit is {limit}")]
    TooManyPdus { count: usize, limit: usize },

    #[error("Malformed PDU: {0}")]
    MalformedPdu(String),

    // ── Discovery ───────────────────────────────────────────────────────────

    #[error("Server '{0}' returned a bad well-known response")]
    BadWellKnown(String),

    // ── Remote communication ─────────────────────────────────────────────────

    #[error("HTTP error communicating with remote server '{0}': {1}")]
    RemoteHttp(String, String),

    #[error("Remote server '{0}' returned an unexpected response: {1}")]
    RemoteProtocol(String, String),

    #[error("Remote server '{0}' is not reachable")]
    RemoteUnreachable(String),

    // ── General ─────────────────────────────────────────────────────────────

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FederationError {
    /// Worth retrying later: the remote may come back.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RemoteHttp(..) | Self::RemoteUnreachable(_))
    }
}

impl From<reqwest::Error> for FederationError {
    fn from(e: reqwest::Error) -> Self {
        let server = e.url().map(|u| u.host_str().unwrap_or("?").to_owned()).unwrap_or_default();
        if e.is_connect() || e.is_timeout() {
            return FederationError::RemoteUnreachable(server);
        }
        FederationError::RemoteHttp(server, e.to_string())
    }
}

impl From<FederationError> for HearthError {
    fn from(e: FederationError) -> Self {
        match e {
            FederationError::MissingAuthHeader
            | FederationError::MalformedAuthHeader(_)
            | FederationError::InvalidSignature
            | FederationError::KeyNotFound { .. } => HearthError::BadSignature { message: e.to_string() },
            FederationError::HashMismatch { .. } => HearthError::BadSignature { message: e.to_string() },
            FederationError::TooManyPdus { .. } => HearthError::LimitReached { message: e.to_string() },
            FederationError::MalformedPdu(message) => HearthError::Validation { message },
            FederationError::Serialisation(e) => HearthError::Validation { message: e.to_string() },
            FederationError::RemoteHttp(server, _)
            | FederationError::RemoteProtocol(server, _)
            | FederationError::RemoteUnreachable(server)
            | FederationError::BadWellKnown(server) => HearthError::RemoteUnavailable { server },
            other => HearthError::Internal(anyhow::anyhow!(other)),
        }
    }
}
