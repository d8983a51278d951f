//! Per-task lifecycle state machine.
//!
//! The legal transition graph is closed: anything not listed here is
//! rejected with `InvalidTransition`, logged, and never retried. Every
//! applied transition is recorded with reason, message and wall-clock.

use serde::{Deserialize, Serialize};
use tracing::warn;

use regatta_core::{epoch_millis, TaskState};

use crate::error::TaskError;

/// How many transition records each task keeps.
const HISTORY_LIMIT: usize = 32;

/// One applied transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: TaskState,
    pub to: TaskState,
    pub reason: String,
    pub message: String,
    /// Unix milliseconds when the transition was applied.
    pub at_ms: u64,
}

/// Whether `from -> to` is a legal edge of the lifecycle graph.
pub fn is_legal(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    match (from, to) {
        (Initialized, Pending)
        | (Pending, Ready)
        | (Ready, Placing)
        // Placement outcome, retry, or stateful reservation.
        | (Placing, Placed)
        | (Placing, Ready)
        | (Placing, Reserved)
        | (Reserved, Placed)
        | (Placed, Launching)
        // Launch outcome; Ready on launch failure.
        | (Launching, Launched)
        | (Launching, Ready)
        | (Launching, Lost)
        | (Launched, Starting)
        | (Launched, Running)
        | (Launched, Lost)
        | (Starting, Running)
        | (Starting, Lost)
        | (Running, Succeeded)
        | (Running, Failed)
        | (Running, Lost)
        | (Running, Preempting)
        | (Preempting, Killed)
        | (Preempting, Lost)
        | (Killing, Killed)
        | (Killing, Lost)
        // Retry paths regenerate the attempt from scratch.
        | (Failed, Initialized)
        | (Lost, Initialized) => true,
        // A kill request interrupts any non-terminal state.
        (from, Killing) => !from.is_terminal() && from != Killing,
        _ => false,
    }
}

/// State machine for one task, with bounded transition history.
#[derive(Debug, Clone)]
pub struct TaskStateMachine {
    current: TaskState,
    history: Vec<TransitionRecord>,
}

impl TaskStateMachine {
    pub fn new() -> Self {
        Self {
            current: TaskState::Initialized,
            history: Vec::new(),
        }
    }

    pub fn current(&self) -> TaskState {
        self.current
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    /// Apply a transition, or reject it if the edge is illegal.
    pub fn transition(
        &mut self,
        to: TaskState,
        reason: &str,
        message: &str,
    ) -> Result<TransitionRecord, TaskError> {
        let from = self.current;
        if !is_legal(from, to) {
            warn!(?from, ?to, %reason, "illegal task state transition rejected");
            return Err(TaskError::InvalidTransition { from, to });
        }

        let record = TransitionRecord {
            from,
            to,
            reason: reason.to_string(),
            message: message.to_string(),
            at_ms: epoch_millis(),
        };
        self.current = to;
        if self.history.len() == HISTORY_LIMIT {
            self.history.remove(0);
        }
        self.history.push(record.clone());
        Ok(record)
    }
}

impl Default for TaskStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
