//! Control-plane error kinds.
//!
//! Every subsystem maps its failures into these kinds at its boundary so
//! the retry harness and the RPC surface can classify uniformly.

use thiserror::Error;

/// Result type alias for control-plane operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The cluster manager's rejection categories for launch requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmRejectKind {
    /// The offers backing the launch are no longer valid.
    InvalidOffers,
    /// The request itself was malformed from the CM's point of view.
    InvalidArgument,
    /// The CM accepted the request but the launch failed.
    LaunchFailed,
}

impl std::fmt::Display for CmRejectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CmRejectKind::InvalidOffers => "invalid offers",
            CmRejectKind::InvalidArgument => "invalid argument",
            CmRejectKind::LaunchFailed => "launch failed",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by control-plane components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),

    #[error("cluster manager rejected request ({kind}): {message}")]
    CmReject { kind: CmRejectKind, message: String },

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the retry harness is permitted to attempt the operation again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Promote a transient error after retry exhaustion.
    pub fn into_permanent(self) -> Error {
        match self {
            Error::Transient(msg) => Error::Permanent(format!("retries exhausted: {msg}")),
            other => other,
        }
    }

    pub fn cm_reject(kind: CmRejectKind, message: impl Into<String>) -> Error {
        Error::CmReject {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(Error::Transient("timeout".into()).is_transient());
        assert!(!Error::Validation("bad".into()).is_transient());
        assert!(!Error::Conflict("cas".into()).is_transient());
        assert!(!Error::cm_reject(CmRejectKind::InvalidOffers, "x").is_transient());
    }

    #[test]
    fn transient_promotes_to_permanent() {
        let e = Error::Transient("store down".into()).into_permanent();
        assert!(matches!(e, Error::Permanent(_)));

        // Non-transient errors pass through unchanged.
        let e = Error::NotFound("job".into()).into_permanent();
        assert!(matches!(e, Error::NotFound(_)));
    }
}
