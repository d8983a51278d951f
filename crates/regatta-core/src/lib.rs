//! Core domain types for the Regatta control plane.
//!
//! Resource vectors, job/task/gang models, error kinds, the shared retry
//! harness, process-wide counters and the merged daemon configuration.
//! Every other crate in the workspace depends on this one; it depends on
//! nothing but the ambient stack.

pub mod config;
pub mod errors;
pub mod metrics;
pub mod resources;
pub mod retry;
pub mod types;

pub use errors::{CmRejectKind, Error, Result};
pub use resources::{ResourceKind, Resources};
pub use retry::{retry, RetryPolicy};
pub use types::*;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
