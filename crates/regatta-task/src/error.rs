//! Task and tracker error types.

use thiserror::Error;

use regatta_core::{TaskId, TaskState};

/// Result type alias for tracker operations.
pub type TaskResult<T> = Result<T, TaskError>;

/// Errors from the task state machine and the tracker.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("task not in tracker: {0}")]
    NotTracked(TaskId),

    #[error("task already in tracker: {0}")]
    AlreadyTracked(TaskId),

    #[error("stale cluster-manager task id for {task_id}: tracked {tracked}, received {received}")]
    StaleCmTaskId {
        task_id: TaskId,
        tracked: String,
        received: String,
    },
}

impl From<TaskError> for regatta_core::Error {
    fn from(e: TaskError) -> Self {
        match &e {
            TaskError::InvalidTransition { .. } => regatta_core::Error::Permanent(e.to_string()),
            TaskError::NotTracked(id) => regatta_core::Error::NotFound(format!("task {id}")),
            TaskError::AlreadyTracked(id) => {
                regatta_core::Error::AlreadyExists(format!("task {id}"))
            }
            TaskError::StaleCmTaskId { .. } => regatta_core::Error::Conflict(e.to_string()),
        }
    }
}
