//! Resource-pool error types.

use thiserror::Error;

use regatta_core::PoolId;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors from the resource-pool tree.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no such pool: {0}")]
    NoSuchPool(PoolId),

    #[error("pool already exists: {0}")]
    PoolExists(PoolId),

    #[error("pool is not a leaf: {0}")]
    PoolNotLeaf(PoolId),

    #[error("pool is frozen (parent removed): {0}")]
    PoolGone(PoolId),

    #[error("invalid hierarchy: {0}")]
    InvalidHierarchy(String),
}

impl From<PoolError> for regatta_core::Error {
    fn from(e: PoolError) -> Self {
        match &e {
            PoolError::NoSuchPool(id) => regatta_core::Error::NotFound(format!("pool {id}")),
            PoolError::PoolExists(id) => regatta_core::Error::AlreadyExists(format!("pool {id}")),
            PoolError::PoolNotLeaf(_) | PoolError::InvalidHierarchy(_) => {
                regatta_core::Error::Validation(e.to_string())
            }
            PoolError::PoolGone(_) => regatta_core::Error::Conflict(e.to_string()),
        }
    }
}
