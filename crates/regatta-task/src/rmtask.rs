//! A task as owned by the tracker.
//!
//! `RmTask` wraps the immutable task description with the state machine,
//! the placement backoff and the dwell deadline of the current state. One
//! mutex per task; the tracker hands out `Arc<Mutex<RmTask>>` handles.

use std::time::Duration;

use regatta_core::{epoch_millis, TaskDesc, TaskState};

use crate::backoff::{BackoffPolicy, PlacementBackoff};
use crate::error::TaskResult;
use crate::state_machine::{TaskStateMachine, TransitionRecord};

/// Maximum dwell times per non-terminal state.
#[derive(Debug, Clone, Copy)]
pub struct DwellTimeouts {
    pub placing: Duration,
    /// Covers Launching, Launched and Starting without a CM update.
    pub launching: Duration,
    pub preempting: Duration,
}

impl Default for DwellTimeouts {
    fn default() -> Self {
        Self {
            placing: Duration::from_secs(10 * 60),
            launching: Duration::from_secs(20 * 60),
            preempting: Duration::from_secs(10 * 60),
        }
    }
}

impl DwellTimeouts {
    /// Dwell limit for a state, if it has one.
    fn limit(&self, state: TaskState) -> Option<Duration> {
        match state {
            TaskState::Placing => Some(self.placing),
            TaskState::Launching | TaskState::Launched | TaskState::Starting => {
                Some(self.launching)
            }
            TaskState::Preempting => Some(self.preempting),
            _ => None,
        }
    }
}

/// A tracked task with lifecycle machinery attached.
#[derive(Debug)]
pub struct RmTask {
    desc: TaskDesc,
    sm: TaskStateMachine,
    backoff: PlacementBackoff,
    timeouts: DwellTimeouts,
    /// Host this task is currently bound to, if any.
    host: Option<String>,
    /// Deadline (unix ms) for the current state's dwell, if limited.
    dwell_deadline_ms: Option<u64>,
}

impl RmTask {
    pub fn new(desc: TaskDesc, backoff: BackoffPolicy, timeouts: DwellTimeouts) -> Self {
        Self {
            desc,
            sm: TaskStateMachine::new(),
            backoff: PlacementBackoff::new(backoff),
            timeouts,
            host: None,
            dwell_deadline_ms: None,
        }
    }

    pub fn desc(&self) -> &TaskDesc {
        &self.desc
    }

    pub fn state(&self) -> TaskState {
        self.sm.current()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn history(&self) -> &[TransitionRecord] {
        self.sm.history()
    }

    pub(crate) fn set_host(&mut self, host: Option<String>) {
        self.host = host;
    }

    /// Swap in a regenerated CM task id for the next attempt.
    pub fn set_cm_task_id(&mut self, cm_task_id: String) {
        self.desc.cm_task_id = cm_task_id;
    }

    /// Apply a transition and arm the dwell deadline of the new state.
    pub fn transition(
        &mut self,
        to: TaskState,
        reason: &str,
        message: &str,
    ) -> TaskResult<TransitionRecord> {
        let record = self.sm.transition(to, reason, message)?;
        self.dwell_deadline_ms = self
            .timeouts
            .limit(to)
            .map(|d| record.at_ms + d.as_millis() as u64);
        Ok(record)
    }

    /// Whether the current state has overstayed its dwell limit.
    pub fn dwell_expired(&self, now_ms: u64) -> bool {
        self.dwell_deadline_ms.is_some_and(|deadline| now_ms >= deadline)
    }

    /// The state a dwell-expired task falls back to.
    pub fn dwell_fallback(&self) -> Option<TaskState> {
        match self.state() {
            TaskState::Placing => Some(TaskState::Ready),
            TaskState::Launching | TaskState::Launched | TaskState::Starting => {
                Some(TaskState::Lost)
            }
            TaskState::Preempting => Some(TaskState::Lost),
            _ => None,
        }
    }

    /// Record a failed placement round; the task becomes ineligible until
    /// the backoff elapses.
    pub fn record_placement_failure(&mut self) -> Duration {
        self.backoff.on_no_match(epoch_millis())
    }

    /// Record a successful placement; resets backoff.
    pub fn record_placement_success(&mut self) {
        self.backoff.on_success();
    }

    /// Whether the backoff gate allows another placement attempt.
    pub fn placement_eligible(&self, now_ms: u64) -> bool {
        self.backoff.eligible(now_ms)
    }

    pub fn backoff(&self) -> &PlacementBackoff {
        &self.backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regatta_core::{new_cm_task_id, TaskSpec, TaskType};

    fn make_task() -> RmTask {
        let desc = TaskDesc {
            id: "j-0".into(),
            job_id: "j".into(),
            instance_idx: 0,
            task_type: TaskType::Batch,
            respool_id: "leaf".into(),
            priority: 1,
            preemptible: true,
            spec: TaskSpec::default(),
            cm_task_id: new_cm_task_id("j-0"),
        };
        RmTask::new(
            desc,
            BackoffPolicy::default(),
            DwellTimeouts {
                placing: Duration::from_millis(50),
                launching: Duration::from_millis(50),
                preempting: Duration::from_millis(50),
            },
        )
    }

    #[test]
    fn dwell_deadline_armed_on_limited_states() {
        let mut task = make_task();
        task.transition(TaskState::Pending, "t", "").unwrap();
        assert!(task.dwell_deadline_ms.is_none());

        task.transition(TaskState::Ready, "t", "").unwrap();
        task.transition(TaskState::Placing, "t", "").unwrap();
        assert!(task.dwell_deadline_ms.is_some());
        assert_eq!(task.dwell_fallback(), Some(TaskState::Ready));
    }

    #[test]
    fn dwell_expiry_fires_after_limit() {
        let mut task = make_task();
        task.transition(TaskState::Pending, "t", "").unwrap();
        task.transition(TaskState::Ready, "t", "").unwrap();
        task.transition(TaskState::Placing, "t", "").unwrap();

        let deadline = task.dwell_deadline_ms.unwrap();
        assert!(!task.dwell_expired(deadline - 1));
        assert!(task.dwell_expired(deadline));
    }

    #[test]
    fn launch_states_fall_back_to_lost() {
        let mut task = make_task();
        for state in [
            TaskState::Pending,
            TaskState::Ready,
            TaskState::Placing,
            TaskState::Placed,
            TaskState::Launching,
        ] {
            task.transition(state, "t", "").unwrap();
        }
        assert_eq!(task.dwell_fallback(), Some(TaskState::Lost));
    }

    #[test]
    fn backoff_gate_round_trip() {
        let mut task = make_task();
        assert!(task.placement_eligible(0));

        let b = task.record_placement_failure();
        assert!(b > Duration::ZERO);
        assert!(!task.placement_eligible(epoch_millis()));

        task.record_placement_success();
        assert!(task.placement_eligible(epoch_millis()));
    }
}
