//! Hierarchical fair-share admission: the resource-pool tree and the
//! scheduler that drains gangs pending -> ready by entitlement.

pub mod entitlement;
pub mod error;
pub mod pool;
pub mod scheduler;
pub mod tree;

pub use entitlement::{compute_entitlements, PoolSnapshot};
pub use error::{PoolError, PoolResult};
pub use scheduler::Scheduler;
pub use tree::{PoolStatus, PoolTree};
