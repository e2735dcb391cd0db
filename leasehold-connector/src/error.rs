//! Connector error types.

use leasehold_core::EntityError;
use leasehold_runtime::{CommandError, ProcessError};
use leasehold_storage::StoreError;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    /// May succeed on a later attempt (network, timeout, throttling).
    #[error("transient collaborator failure: {0}")]
    Transient(String),

    /// Will not succeed without intervention.
    #[error("fatal collaborator failure: {0}")]
    Fatal(String),
}

impl CollaboratorError {
    pub fn transient(msg: impl Into<String>) -> Self {
        CollaboratorError::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        CollaboratorError::Fatal(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CollaboratorError::Transient(_))
    }

    /// The failure text without the classification prefix.
    pub fn detail(&self) -> &str {
        match self {
            CollaboratorError::Transient(msg) | CollaboratorError::Fatal(msg) => msg,
        }
    }
}

impl From<CollaboratorError> for ProcessError {
    fn from(err: CollaboratorError) -> Self {
        ProcessError::Unrecoverable(err.to_string())
    }
}

/// Runs a collaborator call, turning an elapsed `limit` into a transient
/// failure.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, CollaboratorError>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CollaboratorError::Transient(format!(
            "timed out after {} ms",
            limit.as_millis()
        ))),
    }
}

/// Errors surfaced by the connector runtime's API.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Entity(#[from] EntityError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Command(#[from] CommandError),
}

impl ConnectorError {
    /// Returns an error code suitable for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            ConnectorError::Entity(_) => "BAD_REQUEST",
            ConnectorError::Store(e) => e.error_code(),
            ConnectorError::Command(e) => e.error_code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let t = CollaboratorError::transient("connection reset");
        assert!(t.is_retryable());
        assert_eq!(t.detail(), "connection reset");

        let f = CollaboratorError::fatal("unknown asset");
        assert!(!f.is_retryable());

        let p: ProcessError = f.into();
        assert!(matches!(p, ProcessError::Unrecoverable(ref m) if m.contains("unknown asset")));
    }

    #[tokio::test]
    async fn test_with_timeout_elapsed_is_transient() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, CollaboratorError>(())
        };
        let err = with_timeout(Duration::from_millis(10), slow).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.detail().contains("timed out"));

        let fast = async { Ok::<_, CollaboratorError>(7) };
        assert_eq!(with_timeout(Duration::from_secs(1), fast).await.unwrap(), 7);
    }
}
