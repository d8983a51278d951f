//! Persistence layer for the Regatta control plane.
//!
//! One `Store` collaborator composed of independent capability traits
//! (jobs, tasks, resource pools, framework info, volumes, updates), plus an
//! embedded redb-backed implementation used by the daemon and by tests.

pub mod error;
pub mod store;
pub mod tables;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use store::EmbeddedStore;
pub use traits::{
    FrameworkInfoStore, JobStore, ResourcePoolStore, Store, TaskStore, UpdateStore, VolumeStore,
};
