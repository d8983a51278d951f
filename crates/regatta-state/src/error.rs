//! Error signals for store operations.
//!
//! The first four signals are permanent; the rest are transient and may be
//! retried by the caller's retry harness.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors signalled by a storage backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("read failure: {0}")]
    ReadFailure(String),

    #[error("write failure: {0}")]
    WriteFailure(String),

    #[error("read timeout: {0}")]
    ReadTimeout(String),

    #[error("write timeout: {0}")]
    WriteTimeout(String),

    #[error("request unavailable: {0}")]
    RequestUnavailable(String),

    #[error("connection unavailable: {0}")]
    ConnUnavailable(String),

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("too many timeouts: {0}")]
    TooManyTimeouts(String),

    #[error("compare-and-set not applied: {0}")]
    CasNotApplied(String),
}

impl StoreError {
    /// Whether the operation may be retried.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            StoreError::NotFound(_)
                | StoreError::AlreadyExists(_)
                | StoreError::ReadFailure(_)
                | StoreError::WriteFailure(_)
        )
    }
}

impl From<StoreError> for regatta_core::Error {
    fn from(e: StoreError) -> Self {
        match &e {
            StoreError::NotFound(msg) => regatta_core::Error::NotFound(msg.clone()),
            StoreError::AlreadyExists(msg) => regatta_core::Error::AlreadyExists(msg.clone()),
            StoreError::CasNotApplied(msg) => regatta_core::Error::Conflict(msg.clone()),
            _ if e.is_transient() => regatta_core::Error::Transient(e.to_string()),
            _ => regatta_core::Error::Permanent(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transience_classification() {
        assert!(!StoreError::NotFound("x".into()).is_transient());
        assert!(!StoreError::AlreadyExists("x".into()).is_transient());
        assert!(!StoreError::ReadFailure("x".into()).is_transient());
        assert!(!StoreError::WriteFailure("x".into()).is_transient());

        assert!(StoreError::ReadTimeout("x".into()).is_transient());
        assert!(StoreError::ConnUnavailable("x".into()).is_transient());
        assert!(StoreError::TooManyTimeouts("x".into()).is_transient());
        assert!(StoreError::CasNotApplied("x".into()).is_transient());
    }

    #[test]
    fn maps_to_core_error_kinds() {
        use regatta_core::Error;

        assert!(matches!(
            Error::from(StoreError::NotFound("j".into())),
            Error::NotFound(_)
        ));
        assert!(matches!(
            Error::from(StoreError::CasNotApplied("t".into())),
            Error::Conflict(_)
        ));
        assert!(matches!(
            Error::from(StoreError::WriteTimeout("t".into())),
            Error::Transient(_)
        ));
        assert!(matches!(
            Error::from(StoreError::WriteFailure("t".into())),
            Error::Permanent(_)
        ));
    }
}
