//! Goal-state convergence: delay queues and the driver that reconciles
//! observed task/job state with the declared goal state.

pub mod driver;
pub mod queue;

pub use driver::{DriverConfig, GoalStateDriver};
pub use queue::DelayQueue;
