//! Task lifecycle machinery: state machine, placement backoff, tracker.

pub mod backoff;
pub mod error;
pub mod rmtask;
pub mod state_machine;
pub mod tracker;

pub use backoff::{BackoffPolicy, PlacementBackoff};
pub use error::{TaskError, TaskResult};
pub use rmtask::{DwellTimeouts, RmTask};
pub use state_machine::{is_legal, TaskStateMachine, TransitionRecord};
pub use tracker::{ExpiredTask, HostDrainListener, PoolAllocations, Tracker};
