//! Core error types.

use thiserror::Error;

/// Errors raised while constructing or decoding entities.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EntityError {
    #[error("entity id must not be empty")]
    EmptyId,

    #[error("unknown state code {code} for {entity_type}")]
    UnknownStateCode {
        entity_type: &'static str,
        code: i32,
    },

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl EntityError {
    /// Returns an error code suitable for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            EntityError::EmptyId => "BAD_REQUEST",
            EntityError::UnknownStateCode { .. } => "BAD_REQUEST",
            EntityError::InvalidField { .. } => "BAD_REQUEST",
        }
    }
}
