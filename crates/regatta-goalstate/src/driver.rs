//! The goal-state driver.
//!
//! Converges observed task and job state toward the declared goal state.
//! Work arrives on two delay queues (tasks, jobs) and is processed by a
//! worker pool. Every step is idempotent: it loads state, computes the
//! convergence action, and applies it; running a step twice produces the
//! same result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use regatta_cluster::ClusterManagerClient;
use regatta_core::{
    epoch_secs, parse_task_id, task_id, Error, Gang, JobId, JobState, Result, RetryPolicy,
    TaskDesc, TaskId, TaskRuntime, TaskState,
};
use regatta_respool::Scheduler;
use regatta_state::{JobStore, TaskStore};
use regatta_task::Tracker;

use crate::queue::DelayQueue;

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub worker_count: usize,
    /// Default delay before a re-enqueued entity is reconsidered.
    pub requeue_delay: Duration,
    /// Launch/run retries before a task is failed terminally.
    pub max_task_retries: u32,
    pub retry: RetryPolicy,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            requeue_delay: Duration::from_secs(1),
            max_task_retries: 3,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct GoalStateDriver {
    jobs: Arc<dyn JobStore>,
    tasks: Arc<dyn TaskStore>,
    tracker: Arc<Tracker>,
    scheduler: Arc<Scheduler>,
    cm: Arc<dyn ClusterManagerClient>,
    task_queue: DelayQueue,
    job_queue: DelayQueue,
    config: DriverConfig,
}

impl GoalStateDriver {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        tasks: Arc<dyn TaskStore>,
        tracker: Arc<Tracker>,
        scheduler: Arc<Scheduler>,
        cm: Arc<dyn ClusterManagerClient>,
        config: DriverConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            jobs,
            tasks,
            tracker,
            scheduler,
            cm,
            task_queue: DelayQueue::new(),
            job_queue: DelayQueue::new(),
            config,
        })
    }

    pub fn enqueue_task(&self, id: &TaskId, delay: Duration) {
        self.task_queue.enqueue(id, delay);
    }

    pub fn enqueue_job(&self, id: &JobId, delay: Duration) {
        self.job_queue.enqueue(id, delay);
    }

    pub fn queued_tasks(&self) -> usize {
        self.task_queue.len()
    }

    pub fn queued_jobs(&self) -> usize {
        self.job_queue.len()
    }

    // ── Per-task convergence ───────────────────────────────────────

    pub async fn step_task(&self, id: &TaskId) -> Result<()> {
        let (job_id, instance_idx) = parse_task_id(id)
            .ok_or_else(|| Error::Validation(format!("malformed task id {id}")))?;

        let runtime = regatta_core::retry(&self.config.retry, "load task runtime", || async move {
            self.tasks.get_task_by_id(id).await.map_err(Error::from)
        })
        .await?;

        if runtime.state.is_terminal() {
            return self.converge_terminal(id, &job_id, instance_idx, runtime).await;
        }

        if runtime.goal_state == TaskState::Killed {
            return self.converge_kill(id, &job_id, runtime).await;
        }

        if runtime.state == TaskState::Initialized {
            // Not yet in the scheduling pipeline (fresh submission or
            // recovery): enqueue its gang.
            self.submit_instance(&job_id, instance_idx, runtime, false).await?;
            return Ok(());
        }

        // Mid-pipeline and converging on its own.
        debug!(task_id = %id, state = ?runtime.state, "no goal-state action needed");
        Ok(())
    }

    /// Terminal task: return resources, retry if the goal wants it
    /// running again, and recompute the owning job.
    async fn converge_terminal(
        &self,
        id: &TaskId,
        job_id: &JobId,
        instance_idx: u32,
        mut runtime: TaskRuntime,
    ) -> Result<()> {
        // Remove from the tracker if still present; a stale CM id means
        // a newer attempt is already tracked and must be left alone.
        if self.tracker.get_task(id).is_some() {
            let _ = self.tracker.mark_done(id, &runtime.cm_task_id);
        }

        let wants_restart = matches!(runtime.state, TaskState::Failed | TaskState::Lost)
            && matches!(
                runtime.goal_state,
                TaskState::Running | TaskState::Succeeded
            );
        if wants_restart {
            if runtime.fail_count <= self.config.max_task_retries {
                info!(task_id = %id, fail_count = runtime.fail_count, "retrying terminal task");
                self.submit_instance(job_id, instance_idx, runtime, true).await?;
            } else if runtime.state != TaskState::Failed || runtime.reason != "retries_exhausted" {
                runtime.state = TaskState::Failed;
                runtime.reason = "retries_exhausted".to_string();
                runtime.message = format!(
                    "gave up after {} failed attempts",
                    runtime.fail_count
                );
                self.persist_task_runtime(id, runtime).await?;
            }
        }

        self.job_queue.enqueue(job_id, self.config.requeue_delay);
        Ok(())
    }

    /// Drive a task whose goal is Killed.
    async fn converge_kill(&self, id: &TaskId, job_id: &JobId, mut runtime: TaskRuntime) -> Result<()> {
        let launched = matches!(
            runtime.state,
            TaskState::Launching
                | TaskState::Launched
                | TaskState::Starting
                | TaskState::Running
                | TaskState::Killing
        );

        if launched {
            if runtime.state != TaskState::Killing {
                let cm_task_id = runtime.cm_task_id.clone();
                regatta_core::retry(&self.config.retry, "kill task", || {
                    let cm_task_id = cm_task_id.clone();
                    async move { self.cm.kill_task(&cm_task_id).await }
                })
                .await?;
                let _ = self.tracker.transition(id, TaskState::Killing, "kill", "goal state is killed");
                runtime.state = TaskState::Killing;
                self.persist_task_runtime(id, runtime).await?;
            }
            // Terminal KILLED arrives on the status stream.
            return Ok(());
        }

        // Never handed to the CM: the kill completes locally.
        let _ = self.tracker.transition(id, TaskState::Killing, "kill", "goal state is killed");
        let _ = self.tracker.transition(id, TaskState::Killed, "kill", "killed before launch");
        let _ = self.tracker.mark_invalid(id, &runtime.cm_task_id);
        runtime.state = TaskState::Killed;
        runtime.reason = "killed_before_launch".to_string();
        self.persist_task_runtime(id, runtime).await?;
        info!(task_id = %id, "task killed before launch");

        self.job_queue.enqueue(job_id, self.config.requeue_delay);
        Ok(())
    }

    /// (Re-)submit one instance as a fresh gang of one.
    async fn submit_instance(
        &self,
        job_id: &JobId,
        instance_idx: u32,
        mut runtime: TaskRuntime,
        regenerate: bool,
    ) -> Result<()> {
        let id = task_id(job_id, instance_idx);

        // Already travelling through the pipeline (e.g. a recovery sweep
        // raced a live submission): nothing to do. A terminal leftover is
        // evicted so the fresh attempt starts from a clean state machine.
        if let Some(handle) = self.tracker.get_task(&id) {
            let (state, tracked_cm_id) = {
                let task = handle.lock().unwrap();
                (task.state(), task.desc().cm_task_id.clone())
            };
            if !state.is_terminal() {
                debug!(task_id = %id, ?state, "skipping resubmit of in-flight task");
                return Ok(());
            }
            let _ = self.tracker.mark_done(&id, &tracked_cm_id);
        }

        let spec = regatta_core::retry(&self.config.retry, "load job config", || async move {
            self.jobs.get_job_config(job_id).await.map_err(Error::from)
        })
        .await?;
        if regenerate {
            runtime.regenerate_cm_task_id(&id);
        }
        runtime.state = TaskState::Initialized;
        runtime.host = None;
        runtime.agent_id = None;
        runtime.ports.clear();
        self.persist_task_runtime(&id, runtime.clone()).await?;

        let desc = TaskDesc {
            id: id.clone(),
            job_id: job_id.clone(),
            instance_idx,
            task_type: spec.job_type.into(),
            respool_id: spec.respool_id.clone(),
            priority: spec.sla.priority,
            preemptible: spec.sla.preemptible,
            spec: spec.task_spec(instance_idx).clone(),
            cm_task_id: runtime.cm_task_id.clone(),
        };
        self.scheduler
            .submit_gangs(&spec.respool_id, vec![Gang::of(vec![desc])])
            .map_err(Error::from)?;
        debug!(task_id = %id, "instance re-enqueued for scheduling");
        Ok(())
    }

    /// Persist a task runtime; a CAS conflict triggers one re-read and a
    /// single retry before the conflict is surfaced.
    async fn persist_task_runtime(&self, id: &TaskId, runtime: TaskRuntime) -> Result<()> {
        match regatta_core::retry(&self.config.retry, "persist task runtime", || {
            let runtime = runtime.clone();
            async move {
                self.tasks
                    .update_task_runtime(id, &runtime)
                    .await
                    .map_err(Error::from)
            }
        })
        .await
        {
            Err(Error::Conflict(_)) => {
                // Re-read and retry once; a second conflict goes to the caller.
                let _ = self.tasks.get_task_by_id(id).await;
                self.tasks
                    .update_task_runtime(id, &runtime)
                    .await
                    .map_err(Error::from)
            }
            other => other,
        }
    }

    // ── Per-job convergence ────────────────────────────────────────

    pub async fn step_job(&self, job_id: &JobId) -> Result<()> {
        let spec = regatta_core::retry(&self.config.retry, "load job config", || async move {
            self.jobs.get_job_config(job_id).await.map_err(Error::from)
        })
        .await?;
        let mut runtime = regatta_core::retry(&self.config.retry, "load job runtime", || async move {
            self.jobs.get_job_runtime(job_id).await.map_err(Error::from)
        })
        .await?;
        let tasks = regatta_core::retry(&self.config.retry, "load job tasks", || async move {
            self.tasks.get_tasks_for_job(job_id).await.map_err(Error::from)
        })
        .await?;

        let mut stats: HashMap<String, u32> = HashMap::new();
        let mut running = 0u32;
        let mut succeeded = 0u32;
        let mut failed = 0u32;
        let mut killed = 0u32;
        let mut terminal = 0u32;
        for rt in tasks.values() {
            *stats.entry(rt.state.name().to_string()).or_insert(0) += 1;
            match rt.state {
                TaskState::Running => running += 1,
                TaskState::Succeeded => succeeded += 1,
                TaskState::Failed => failed += 1,
                TaskState::Killed => killed += 1,
                _ => {}
            }
            if rt.state.is_terminal() {
                terminal += 1;
            }
        }

        let total = tasks.len() as u32;
        let all_terminal = total > 0 && terminal == total;
        let new_state = if total == 0 {
            runtime.state
        } else if all_terminal && succeeded == total {
            JobState::Succeeded
        } else if all_terminal && failed > 0 {
            JobState::Failed
        } else if all_terminal && killed > 0 {
            JobState::Killed
        } else if running > 0 {
            JobState::Running
        } else {
            JobState::Pending
        };

        // SLA floor: a live job below min running instances re-enqueues
        // its restartable tasks and reports Pending.
        let mut final_state = new_state;
        if !new_state.is_terminal()
            && runtime.goal_state != JobState::Killed
            && running < spec.sla.min_running_instances
        {
            final_state = JobState::Pending;
            for (idx, rt) in &tasks {
                if matches!(rt.state, TaskState::Failed | TaskState::Lost) {
                    self.task_queue
                        .enqueue(&task_id(job_id, *idx), Duration::ZERO);
                }
            }
        }

        let now = epoch_secs();
        let mut changed = false;
        if runtime.state != final_state {
            info!(job_id = %job_id, from = ?runtime.state, to = ?final_state, "job state recomputed");
            runtime.state = final_state;
            changed = true;
        }
        if final_state == JobState::Running && runtime.start_time.is_none() {
            runtime.start_time = Some(now);
            changed = true;
        }
        if final_state.is_terminal() && runtime.completion_time.is_none() {
            runtime.completion_time = Some(now);
            changed = true;
        }
        if runtime.task_stats != stats {
            runtime.task_stats = stats;
            changed = true;
        }

        if changed {
            regatta_core::retry(&self.config.retry, "persist job runtime", || {
                let runtime = runtime.clone();
                async move {
                    self.jobs
                        .update_job_runtime(job_id, &runtime)
                        .await
                        .map_err(Error::from)
                }
            })
            .await?;
        }
        Ok(())
    }

    // ── Worker pool ────────────────────────────────────────────────

    /// Run the worker pool until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(workers = self.config.worker_count, "goal-state driver started");
        let mut handles = Vec::new();
        for worker in 0..self.config.worker_count {
            let driver = Arc::clone(&self);
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        id = driver.task_queue.pop() => {
                            if let Err(e) = driver.step_task(&id).await {
                                warn!(task_id = %id, error = %e, "task step failed");
                            }
                        }
                        id = driver.job_queue.pop() => {
                            if let Err(e) = driver.step_job(&id).await {
                                warn!(job_id = %id, error = %e, "job step failed");
                            }
                        }
                        _ = shutdown.changed() => {
                            debug!(worker, "goal-state worker shutting down");
                            break;
                        }
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!("goal-state driver stopped");
    }
}
