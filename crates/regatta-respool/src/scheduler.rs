//! The admission scheduler.
//!
//! A single timer drains gangs pending -> ready across the pool tree by
//! fair share, transitioning member tasks through the tracker. Also the
//! front door for new work: `submit_gangs` registers tasks with the
//! tracker and enqueues them into their leaf pool.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use regatta_core::metrics::SchedulerMetrics;
use regatta_core::{Gang, PoolId, TaskState};
use regatta_task::Tracker;

use crate::error::PoolResult;
use crate::tree::PoolTree;

pub struct Scheduler {
    tree: Arc<PoolTree>,
    tracker: Arc<Tracker>,
    metrics: Arc<SchedulerMetrics>,
    scheduling_period: Duration,
    ready_queue_limit: usize,
}

impl Scheduler {
    pub fn new(
        tree: Arc<PoolTree>,
        tracker: Arc<Tracker>,
        metrics: Arc<SchedulerMetrics>,
        scheduling_period: Duration,
        ready_queue_limit: usize,
    ) -> Self {
        Self {
            tree,
            tracker,
            metrics,
            scheduling_period,
            ready_queue_limit,
        }
    }

    /// Register a batch of gangs with the tracker and enqueue them into
    /// the leaf pool's pending queue.
    pub fn submit_gangs(&self, pool_id: &PoolId, gangs: Vec<Gang>) -> PoolResult<()> {
        for gang in &gangs {
            for task in &gang.tasks {
                self.tracker.add_task(task.clone());
                if let Err(e) =
                    self.tracker
                        .transition(&task.id, TaskState::Pending, "enqueued", "gang submitted")
                {
                    // Re-submissions of an already pending task are benign.
                    debug!(task_id = %task.id, error = %e, "enqueue transition skipped");
                }
            }
        }
        self.tree.enqueue_gangs(pool_id, gangs)
    }

    /// One admission pass over the tree.
    pub fn tick(&self) -> usize {
        let admitted = self.tree.schedule_tick(self.ready_queue_limit);
        for gang in &admitted {
            self.metrics.gangs_admitted_total.fetch_add(1, Ordering::Relaxed);
            for task in &gang.tasks {
                if let Err(e) = self.tracker.transition(
                    &task.id,
                    TaskState::Ready,
                    "admitted",
                    "within pool entitlement",
                ) {
                    warn!(task_id = %task.id, error = %e, "admission transition failed");
                }
            }
        }
        admitted.len()
    }

    /// Run the scheduling loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            period_ms = self.scheduling_period.as_millis() as u64,
            "admission scheduler started"
        );
        let mut interval = tokio::time::interval(self.scheduling_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let admitted = self.tick();
                    if admitted > 0 {
                        debug!(admitted, "admission tick");
                    }
                }
                _ = shutdown.changed() => {
                    info!("admission scheduler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regatta_core::{new_cm_task_id, PoolSpec, Resources, TaskDesc, TaskSpec, TaskType};
    use regatta_task::{BackoffPolicy, DwellTimeouts};

    fn spec(id: &str, parent: Option<&str>, cpu: f64) -> PoolSpec {
        PoolSpec {
            id: id.to_string(),
            parent_id: parent.map(String::from),
            name: id.to_string(),
            reservation: Resources::new(cpu, 0.0, 0.0, 0.0),
            limit: Resources::new(cpu * 2.0, 0.0, 0.0, 0.0),
            share_weight: 1.0,
            policy: Default::default(),
            preemptible: true,
        }
    }

    fn make_gang(pool: &str, id: &str, cpu: f64) -> Gang {
        let mut task_spec = TaskSpec::default();
        task_spec.resources.scalar = Resources::new(cpu, 0.0, 0.0, 0.0);
        Gang::of(vec![TaskDesc {
            id: id.to_string(),
            job_id: "j".to_string(),
            instance_idx: 0,
            task_type: TaskType::Batch,
            respool_id: pool.to_string(),
            priority: 1,
            preemptible: true,
            spec: task_spec,
            cm_task_id: new_cm_task_id(id),
        }])
    }

    fn make_scheduler() -> (Scheduler, Arc<PoolTree>, Arc<Tracker>) {
        let tree = PoolTree::new(spec("root", None, 10.0));
        tree.create_pool(spec("leaf", Some("root"), 10.0)).unwrap();
        let metrics = SchedulerMetrics::new();
        let tracker = Tracker::new(
            tree.clone(),
            metrics.clone(),
            BackoffPolicy::default(),
            DwellTimeouts::default(),
        );
        let scheduler = Scheduler::new(
            tree.clone(),
            tracker.clone(),
            metrics,
            Duration::from_millis(10),
            100,
        );
        (scheduler, tree, tracker)
    }

    #[test]
    fn submit_registers_and_marks_pending() {
        let (scheduler, _, tracker) = make_scheduler();
        scheduler
            .submit_gangs(&"leaf".to_string(), vec![make_gang("leaf", "t-0", 1.0)])
            .unwrap();

        let handle = tracker.get_task(&"t-0".to_string()).unwrap();
        assert_eq!(handle.lock().unwrap().state(), TaskState::Pending);
    }

    #[test]
    fn tick_moves_tasks_to_ready() {
        let (scheduler, tree, tracker) = make_scheduler();
        scheduler
            .submit_gangs(&"leaf".to_string(), vec![make_gang("leaf", "t-0", 2.0)])
            .unwrap();

        assert_eq!(scheduler.tick(), 1);
        let handle = tracker.get_task(&"t-0".to_string()).unwrap();
        assert_eq!(handle.lock().unwrap().state(), TaskState::Ready);
        assert_eq!(
            tree.pool_status(&"leaf".to_string()).unwrap().allocation.cpu,
            2.0
        );
    }

    #[test]
    fn tick_leaves_unaffordable_gangs_pending() {
        let (scheduler, tree, tracker) = make_scheduler();
        scheduler
            .submit_gangs(&"leaf".to_string(), vec![make_gang("leaf", "big", 50.0)])
            .unwrap();

        assert_eq!(scheduler.tick(), 0);
        let handle = tracker.get_task(&"big".to_string()).unwrap();
        assert_eq!(handle.lock().unwrap().state(), TaskState::Pending);
        assert_eq!(tree.pool_status(&"leaf".to_string()).unwrap().pending_gangs, 1);
    }
}
