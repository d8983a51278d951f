//! Authoritative in-memory index of all tracked tasks.
//!
//! Dual index: task id -> RmTask, and host -> task type -> task id for
//! host-scoped queries. The tracker is the single owner of RmTask memory;
//! everything else holds ids. One reader-writer lock guards the indexes;
//! each task carries its own mutex.
//!
//! The pool tree and the offer pool are reached through narrow seams
//! (`PoolAllocations`, drain listener) so neither can call back into the
//! tracker while it holds its lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info, warn};

use regatta_core::metrics::SchedulerMetrics;
use regatta_core::{epoch_millis, Gang, Resources, TaskDesc, TaskId, TaskState, TaskType};

use crate::backoff::BackoffPolicy;
use crate::error::{TaskError, TaskResult};
use crate::rmtask::{DwellTimeouts, RmTask};

/// Allocation bookkeeping seam into the resource-pool tree.
pub trait PoolAllocations: Send + Sync {
    /// Subtract a finished task's resources from its pool's allocation.
    fn subtract_allocation(&self, pool_id: &str, resources: &Resources);
    /// Mark a still-queued task as to-be-dropped on next dequeue.
    fn add_invalid_task(&self, pool_id: &str, task_id: &TaskId);
}

/// Invoked when the last task leaves a host, enabling graceful decommission.
pub type HostDrainListener = Arc<dyn Fn(&str) + Send + Sync>;

/// A task whose state dwell expired, with the fallback applied.
#[derive(Debug, Clone)]
pub struct ExpiredTask {
    pub desc: TaskDesc,
    pub from: TaskState,
    pub to: TaskState,
}

type TaskHandle = Arc<Mutex<RmTask>>;

#[derive(Default)]
struct Indexes {
    tasks: HashMap<TaskId, TaskHandle>,
    placements: HashMap<String, HashMap<TaskType, HashMap<TaskId, TaskHandle>>>,
}

/// The tracker.
pub struct Tracker {
    inner: RwLock<Indexes>,
    pools: Arc<dyn PoolAllocations>,
    drain_listener: RwLock<Option<HostDrainListener>>,
    metrics: Arc<SchedulerMetrics>,
    backoff: BackoffPolicy,
    timeouts: DwellTimeouts,
}

impl Tracker {
    pub fn new(
        pools: Arc<dyn PoolAllocations>,
        metrics: Arc<SchedulerMetrics>,
        backoff: BackoffPolicy,
        timeouts: DwellTimeouts,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Indexes::default()),
            pools,
            drain_listener: RwLock::new(None),
            metrics,
            backoff,
            timeouts,
        })
    }

    /// Wire the offer-pool drain notification. Set once at startup.
    pub fn set_drain_listener(&self, listener: HostDrainListener) {
        *self.drain_listener.write().unwrap() = Some(listener);
    }

    // ── Membership ─────────────────────────────────────────────────

    /// Add a task. Re-adding an already tracked task is a no-op and
    /// returns the existing handle, so retried instances keep their
    /// transition history.
    pub fn add_task(&self, desc: TaskDesc) -> TaskHandle {
        let mut inner = self.inner.write().unwrap();
        if let Some(existing) = inner.tasks.get(&desc.id) {
            return Arc::clone(existing);
        }
        let id = desc.id.clone();
        let handle = Arc::new(Mutex::new(RmTask::new(desc, self.backoff, self.timeouts)));
        inner.tasks.insert(id.clone(), Arc::clone(&handle));
        self.metrics.record_enter(TaskState::Initialized);
        debug!(task_id = %id, "task added to tracker");
        handle
    }

    pub fn get_task(&self, id: &TaskId) -> Option<TaskHandle> {
        self.inner.read().unwrap().tasks.get(id).cloned()
    }

    pub fn size(&self) -> usize {
        self.inner.read().unwrap().tasks.len()
    }

    /// Drop every task and placement without touching pool allocations.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.tasks.clear();
        inner.placements.clear();
    }

    // ── Transitions ────────────────────────────────────────────────

    /// Apply a state transition to a tracked task.
    pub fn transition(
        &self,
        id: &TaskId,
        to: TaskState,
        reason: &str,
        message: &str,
    ) -> TaskResult<()> {
        let handle = self
            .get_task(id)
            .ok_or_else(|| TaskError::NotTracked(id.clone()))?;
        let mut task = handle.lock().unwrap();
        let from = task.state();
        match task.transition(to, reason, message) {
            Ok(_) => {
                self.metrics.record_transition(from, to);
                Ok(())
            }
            Err(e) => {
                self.metrics
                    .invalid_transitions_total
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Scan for dwell-expired tasks and apply their fallback transitions.
    ///
    /// Returns the expired tasks so the caller can re-enqueue (Ready) or
    /// hand them to the goal-state driver (Lost).
    pub fn expire_timeouts(&self) -> Vec<ExpiredTask> {
        let now = epoch_millis();
        let handles: Vec<TaskHandle> = {
            let inner = self.inner.read().unwrap();
            inner.tasks.values().cloned().collect()
        };

        let mut expired = Vec::new();
        for handle in handles {
            let mut task = handle.lock().unwrap();
            if !task.dwell_expired(now) {
                continue;
            }
            let Some(to) = task.dwell_fallback() else {
                continue;
            };
            let from = task.state();
            if task.transition(to, "dwell_timeout", "state exceeded max dwell time").is_ok() {
                self.metrics.record_transition(from, to);
                info!(task_id = %task.desc().id, ?from, ?to, "task state dwell expired");
                expired.push(ExpiredTask {
                    desc: task.desc().clone(),
                    from,
                    to,
                });
            }
        }
        expired
    }

    // ── Placement index ────────────────────────────────────────────

    /// Bind every task of a gang to a host.
    pub fn set_placement_host(&self, gang: &Gang, hostname: &str) {
        let mut inner = self.inner.write().unwrap();
        for task in &gang.tasks {
            Self::set_placement_locked(&mut inner, &task.id, hostname);
        }
    }

    fn set_placement_locked(inner: &mut Indexes, id: &TaskId, hostname: &str) {
        let Some(handle) = inner.tasks.get(id).cloned() else {
            return;
        };
        let task_type = {
            let mut task = handle.lock().unwrap();
            if let Some(old) = task.host().map(str::to_string) {
                Self::remove_placement_locked(inner, &old, task.desc().task_type, id);
            }
            task.set_host(Some(hostname.to_string()));
            task.desc().task_type
        };
        inner
            .placements
            .entry(hostname.to_string())
            .or_default()
            .entry(task_type)
            .or_default()
            .insert(id.clone(), handle);
    }

    /// Unbind a task from its host. Returns the drained host, if the task
    /// was the last one on it.
    fn remove_placement_locked(
        inner: &mut Indexes,
        hostname: &str,
        task_type: TaskType,
        id: &TaskId,
    ) -> Option<String> {
        let by_type = inner.placements.get_mut(hostname)?;
        if let Some(by_id) = by_type.get_mut(&task_type) {
            by_id.remove(id);
            if by_id.is_empty() {
                by_type.remove(&task_type);
            }
        }
        if by_type.is_empty() {
            inner.placements.remove(hostname);
            debug!(host = %hostname, "no tasks left on host");
            return Some(hostname.to_string());
        }
        None
    }

    /// Clear a task's host binding (placement retry).
    pub fn clear_placement(&self, id: &TaskId) {
        let drained = {
            let mut inner = self.inner.write().unwrap();
            let Some(handle) = inner.tasks.get(id).cloned() else {
                return;
            };
            let mut task = handle.lock().unwrap();
            let drained = task
                .host()
                .map(str::to_string)
                .and_then(|host| {
                    Self::remove_placement_locked(&mut inner, &host, task.desc().task_type, id)
                });
            task.set_host(None);
            drained
        };
        self.notify_drained(drained);
    }

    /// All task ids of the given type on the given hosts.
    /// `TaskType::Unknown` matches every type.
    pub fn tasks_by_hosts(
        &self,
        hosts: &[String],
        task_type: TaskType,
    ) -> HashMap<String, Vec<TaskId>> {
        let inner = self.inner.read().unwrap();
        let mut result: HashMap<String, Vec<TaskId>> = HashMap::new();
        for host in hosts {
            let Some(by_type) = inner.placements.get(host) else {
                continue;
            };
            for (t, by_id) in by_type {
                if task_type != TaskType::Unknown && *t != task_type {
                    continue;
                }
                result
                    .entry(host.clone())
                    .or_default()
                    .extend(by_id.keys().cloned());
            }
        }
        result
    }

    // ── Completion ─────────────────────────────────────────────────

    /// Remove a finished task, returning its resources to the pool.
    ///
    /// The caller's CM task id must match the tracker's view; a stale id
    /// means the update belongs to an earlier attempt and is dropped.
    pub fn mark_done(&self, id: &TaskId, cm_task_id: &str) -> TaskResult<()> {
        self.remove_task(id, cm_task_id, false)
    }

    /// Remove a task and, if it was still queued, mark it invalid in its
    /// pool so the queues drop it on next dequeue.
    pub fn mark_invalid(&self, id: &TaskId, cm_task_id: &str) -> TaskResult<()> {
        self.remove_task(id, cm_task_id, true)
    }

    fn remove_task(&self, id: &TaskId, cm_task_id: &str, invalidate: bool) -> TaskResult<()> {
        let drained;
        {
            let mut inner = self.inner.write().unwrap();
            let handle = inner
                .tasks
                .get(id)
                .cloned()
                .ok_or_else(|| TaskError::NotTracked(id.clone()))?;
            let task = handle.lock().unwrap();

            if task.desc().cm_task_id != cm_task_id {
                warn!(
                    task_id = %id,
                    tracked = %task.desc().cm_task_id,
                    received = %cm_task_id,
                    "dropping stale cluster-manager update"
                );
                return Err(TaskError::StaleCmTaskId {
                    task_id: id.clone(),
                    tracked: task.desc().cm_task_id.clone(),
                    received: cm_task_id.to_string(),
                });
            }

            let state = task.state();
            // Tasks still waiting for admission never had allocation added.
            if !matches!(state, TaskState::Pending | TaskState::Initialized) {
                self.pools
                    .subtract_allocation(&task.desc().respool_id, &task.desc().spec.resources.scalar);
            } else if invalidate {
                self.pools.add_invalid_task(&task.desc().respool_id, id);
            }

            drained = task.host().map(str::to_string).and_then(|host| {
                Self::remove_placement_locked(&mut inner, &host, task.desc().task_type, id)
            });

            self.metrics.record_exit(state);
            drop(task);
            inner.tasks.remove(id);
            info!(task_id = %id, "task removed from tracker");
        }
        self.notify_drained(drained);
        Ok(())
    }

    fn notify_drained(&self, drained: Option<String>) {
        if let Some(host) = drained {
            if let Some(listener) = self.drain_listener.read().unwrap().clone() {
                listener(&host);
            }
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Task ids grouped by state name, optionally filtered by job and by a
    /// state set.
    pub fn active_tasks(
        &self,
        job_id: Option<&str>,
        states: &[TaskState],
    ) -> HashMap<&'static str, Vec<TaskId>> {
        let inner = self.inner.read().unwrap();
        let mut result: HashMap<&'static str, Vec<TaskId>> = HashMap::new();
        for (id, handle) in &inner.tasks {
            let task = handle.lock().unwrap();
            if job_id.is_some_and(|j| task.desc().job_id != j) {
                continue;
            }
            let state = task.state();
            if !states.is_empty() && !states.contains(&state) {
                continue;
            }
            result.entry(state.name()).or_default().push(id.clone());
        }
        result
    }
}
