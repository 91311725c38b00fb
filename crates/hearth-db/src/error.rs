//! Storage errors.

use hearth_common::HearthError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{what} '{id}' not found")]
    NotFound { what: &'static str, id: String },

    /// Same identifier, different bytes.
    #[error("Event '{0}' already stored with different content")]
    DuplicateEvent(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { what, id: id.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for HearthError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { what, id } => {
                HearthError::NotFound { resource: format!("{what} {id}") }
            }
            StoreError::Database(e) => HearthError::Database(e),
            other => HearthError::Internal(anyhow::anyhow!(other)),
        }
    }
}
