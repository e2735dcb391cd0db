//! Runtime error types.

use leasehold_storage::StoreError;
use thiserror::Error;

/// Failure of a transition function.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The entity cannot make progress; recorded on the entity.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
}

impl ProcessError {
    pub fn unrecoverable(msg: impl Into<String>) -> Self {
        ProcessError::Unrecoverable(msg.into())
    }

    /// Returns whether a later poll may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProcessError::Store(e) => e.is_retryable() || e.is_conflict(),
            ProcessError::Unrecoverable(_) => false,
        }
    }

    /// Label used for the failure metric.
    pub fn reason(&self) -> &'static str {
        match self {
            ProcessError::Store(e) => e.error_code(),
            ProcessError::Unrecoverable(_) => "UNRECOVERABLE",
        }
    }
}

/// Failure of a synchronously dispatched command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("entity not found: {id}")]
    NotFound { id: String },

    #[error("conflict on entity {id} after {attempts} attempts")]
    Conflict { id: String, attempts: u32 },

    #[error("command {command} not allowed for entity {id} in state {state}")]
    InvalidState {
        id: String,
        command: &'static str,
        state: String,
    },

    #[error("no handler registered for {0}")]
    NoHandler(&'static str),

    #[error("command rejected: {0}")]
    Rejected(String),

    #[error("command queue closed")]
    QueueClosed,

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for CommandError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { id } => CommandError::NotFound { id },
            other => CommandError::Store(other),
        }
    }
}

impl CommandError {
    /// Returns an error code suitable for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            CommandError::NotFound { .. } => "NOT_FOUND",
            CommandError::Conflict { .. } => "CONFLICT",
            CommandError::InvalidState { .. } => "INVALID_STATE",
            CommandError::NoHandler(_) => "NO_HANDLER",
            CommandError::Rejected(_) => "BAD_REQUEST",
            CommandError::QueueClosed => "UNAVAILABLE",
            CommandError::Store(e) => e.error_code(),
        }
    }

    /// Returns whether resubmitting the same command may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CommandError::Conflict { .. } | CommandError::QueueClosed => true,
            CommandError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasehold_storage::ConflictKind;

    #[test]
    fn test_store_not_found_maps_to_command_not_found() {
        let err: CommandError = StoreError::NotFound { id: "neg-1".into() }.into();
        assert!(matches!(&err, CommandError::NotFound { id } if id == "neg-1"));
        assert_eq!(err.error_code(), "NOT_FOUND");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_process_error_classification() {
        let conflict = ProcessError::from(StoreError::Conflict {
            id: "e".into(),
            kind: ConflictKind::LeasedByOther {
                holder: "other".into(),
            },
        });
        assert!(conflict.is_retryable());
        assert_eq!(conflict.reason(), "CONFLICT");

        let fatal = ProcessError::unrecoverable("bad payload");
        assert!(!fatal.is_retryable());
        assert_eq!(fatal.to_string(), "unrecoverable: bad payload");
    }
}
