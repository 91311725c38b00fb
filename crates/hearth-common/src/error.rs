//! Centralized error types for Hearth.
//!
//! Uses `thiserror` for ergonomic error definitions and provides HTTP-friendly
//! error variants that can be directly converted to federation responses.
//! Crate-level errors (`StoreError`, `DagError`, `FederationError`) convert
//! into [`HearthError`] at the API edge.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Core application error type used across all Hearth services.
#[derive(Debug, thiserror::Error)]
pub enum HearthError {
    // === Validation errors (permanent) ===
    #[error("Malformed event or request: {message}")]
    Validation { message: String },

    // === Authorization errors (permanent) ===
    #[error("Event rejected by auth rules: {reason}")]
    Unauthorized { reason: String },

    #[error("Forbidden")]
    Forbidden,

    // === Signature errors (permanent) ===
    #[error("Bad signature: {message}")]
    BadSignature { message: String },

    // === DAG errors (transient) ===
    #[error("Unknown previous events: {}", missing.join(", "))]
    MissingPrevEvents { missing: Vec<String> },

    // === Resource errors ===
    #[error("{resource} not found")]
    NotFound { resource: String },

    // === Capacity ===
    #[error("Limit reached: {message}")]
    LimitReached { message: String },

    // === Network errors (transient) ===
    #[error("Remote server '{server}' unavailable")]
    RemoteUnavailable { server: String },

    // === Infrastructure errors ===
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// JSON error response body sent to remote servers.
#[derive(Serialize)]
struct ErrorResponse {
    errcode: String,
    error: String,
}

impl HearthError {
    /// Map error to HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized { .. } | Self::Forbidden => StatusCode::FORBIDDEN,
            Self::BadSignature { .. } => StatusCode::UNAUTHORIZED,
            Self::MissingPrevEvents { .. } => StatusCode::CONFLICT,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::LimitReached { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RemoteUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error code string for programmatic handling by remote servers.
    pub fn error_code(&self) -> &str {
        match self {
            Self::Validation { .. } => "H_MALFORMED",
            Self::Unauthorized { .. } => "H_UNAUTHORIZED",
            Self::Forbidden => "H_FORBIDDEN",
            Self::BadSignature { .. } => "H_BAD_SIGNATURE",
            Self::MissingPrevEvents { .. } => "H_UNKNOWN_PREVIOUS",
            Self::NotFound { .. } => "H_NOT_FOUND",
            Self::LimitReached { .. } => "H_LIMIT_EXCEEDED",
            Self::RemoteUnavailable { .. } => "H_UNAVAILABLE",
            Self::Database(_) | Self::Internal(_) => "H_UNKNOWN",
        }
    }
}

impl IntoResponse for HearthError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Don't leak internal details to remote servers
        let message = match &self {
            HearthError::Database(e) => {
                tracing::error!("Database error: {e}");
                "An internal error occurred".to_string()
            }
            HearthError::Internal(e) => {
                tracing::error!("Internal error: {e}");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse { errcode: self.error_code().to_string(), error: message };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results using HearthError.
pub type HearthResult<T> = Result<T, HearthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_permanent_codes_differ() {
        let missing = HearthError::MissingPrevEvents { missing: vec!["$a".into()] };
        assert_eq!(missing.status_code(), StatusCode::CONFLICT);
        assert_eq!(missing.error_code(), "H_UNKNOWN_PREVIOUS");
        assert_eq!(HearthError::Forbidden.status_code(), StatusCode::FORBIDDEN);
    }
}
