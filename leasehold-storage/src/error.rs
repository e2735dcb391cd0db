//! Storage error types.

use std::fmt;
use thiserror::Error;

/// Why a write was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// The caller's copy is stale.
    VersionMismatch { expected: u64, actual: u64 },
    /// Another instance holds an unexpired lease.
    LeasedByOther { holder: String },
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::VersionMismatch { expected, actual } => {
                write!(f, "version mismatch (expected {}, stored {})", expected, actual)
            }
            ConflictKind::LeasedByOther { holder } => write!(f, "leased by '{}'", holder),
        }
    }
}

/// Errors from an entity store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity not found: {id}")]
    NotFound { id: String },

    #[error("conflict on entity {id}: {kind}")]
    Conflict { id: String, kind: ConflictKind },

    #[error("cannot {operation} entity {id} in state {state}")]
    InvalidState {
        id: String,
        state: String,
        operation: &'static str,
    },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns whether the whole operation may be retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::StorageUnavailable(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Returns an error code suitable for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "NOT_FOUND",
            StoreError::Conflict { .. } => "CONFLICT",
            StoreError::InvalidState { .. } => "INVALID_STATE",
            StoreError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            StoreError::Serialization(_) => "INTERNAL_ERROR",
        }
    }
}
