//! The placement engine.
//!
//! A pool of workers pulls ready gangs of one task type from the
//! scheduler, claims candidate hosts from the offer pool, binds the gang
//! to the strategy's pick and hands the placement to the launcher. Gangs
//! that find no host within their round/duration budget go back to the
//! scheduler with a placement backoff.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use regatta_core::metrics::SchedulerMetrics;
use regatta_core::{epoch_millis, Constraint, Gang, Placement, TaskState, TaskType};
use regatta_launcher::Launcher;
use regatta_offerpool::{ClaimedHost, HostFilter, OfferPool};
use regatta_respool::PoolTree;
use regatta_task::Tracker;

use crate::strategy::PlacementStrategy;

/// Tuning for one engine instance (one task type).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub task_type: TaskType,
    pub concurrency: usize,
    pub dequeue_limit: usize,
    pub dequeue_timeout: Duration,
    /// Max matching rounds before settling for the current best host.
    /// 0 = place on the first match.
    pub max_rounds: u32,
    /// Max wall-clock spent placing one gang.
    pub max_duration: Duration,
    /// Pause between matching rounds.
    pub round_delay: Duration,
}

pub struct PlacementEngine {
    tree: Arc<PoolTree>,
    offers: Arc<OfferPool>,
    tracker: Arc<Tracker>,
    launcher: Arc<Launcher>,
    strategy: Arc<dyn PlacementStrategy>,
    metrics: Arc<SchedulerMetrics>,
    config: EngineConfig,
}

impl PlacementEngine {
    pub fn new(
        tree: Arc<PoolTree>,
        offers: Arc<OfferPool>,
        tracker: Arc<Tracker>,
        launcher: Arc<Launcher>,
        strategy: Arc<dyn PlacementStrategy>,
        metrics: Arc<SchedulerMetrics>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            tree,
            offers,
            tracker,
            launcher,
            strategy,
            metrics,
            config,
        })
    }

    /// Run the worker pool until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(
            task_type = ?self.config.task_type,
            strategy = self.strategy.name(),
            workers = self.config.concurrency,
            "placement engine started"
        );
        let mut handles = Vec::new();
        for worker in 0..self.config.concurrency {
            let engine = Arc::clone(&self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                engine.worker_loop(worker, shutdown).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!(task_type = ?self.config.task_type, "placement engine stopped");
    }

    async fn worker_loop(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                gangs = self.tree.dequeue_gangs(
                    self.config.dequeue_limit,
                    self.config.task_type,
                    self.config.dequeue_timeout,
                ) => {
                    for gang in gangs {
                        self.place_gang(gang).await;
                    }
                }
                _ = shutdown.changed() => {
                    debug!(worker, "placement worker shutting down");
                    break;
                }
            }
        }
    }

    /// Drive one gang through match -> bind -> launch.
    pub async fn place_gang(&self, gang: Gang) {
        for task in &gang.tasks {
            if let Err(e) =
                self.tracker
                    .transition(&task.id, TaskState::Placing, "placement", "picked by engine")
            {
                debug!(task_id = %task.id, error = %e, "placing transition skipped");
            }
        }

        let filter = build_filter(&gang, self.strategy.fanout());
        let deadline = tokio::time::Instant::now() + self.config.max_duration;
        let mut best: Option<ClaimedHost> = None;
        let mut rounds = 0u32;

        loop {
            let (claimed, counts) = self.offers.claim_for_place(&filter);
            if !claimed.is_empty() {
                rounds += 1;
                best = Some(self.keep_best(&gang, best, claimed));
                let settled = !self.strategy.multi_round()
                    || (self.config.max_rounds > 0 && rounds >= self.config.max_rounds);
                if settled || tokio::time::Instant::now() >= deadline {
                    break;
                }
            } else {
                debug!(?counts, "no hosts matched this round");
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
            }
            tokio::time::sleep(self.config.round_delay).await;
        }

        match best {
            // Budget exhausted with a candidate in hand: launch on the
            // current best host regardless.
            Some(host) => self.bind_and_launch(gang, host).await,
            None => self.return_to_scheduler(gang).await,
        }
    }

    /// Merge this round's claim with the running best, releasing every
    /// host we are not keeping.
    fn keep_best(&self, gang: &Gang, best: Option<ClaimedHost>, claimed: Vec<ClaimedHost>) -> ClaimedHost {
        let mut candidates = claimed;
        if let Some(prev) = best {
            candidates.push(prev);
        }
        let chosen_idx = self.strategy.place_gang(gang, &candidates).unwrap_or(0);
        let chosen = candidates.swap_remove(chosen_idx);
        let released: Vec<String> = candidates.into_iter().map(|h| h.hostname).collect();
        if !released.is_empty() {
            self.offers.release_host_offers(&released);
        }
        chosen
    }

    async fn bind_and_launch(&self, gang: Gang, host: ClaimedHost) {
        let ports: Vec<u16> = host
            .ports
            .iter()
            .take(gang.ports_needed() as usize)
            .copied()
            .collect();

        self.tracker.set_placement_host(&gang, &host.hostname);
        for task in &gang.tasks {
            if let Err(e) = self.tracker.transition(
                &task.id,
                TaskState::Placed,
                "placement",
                &format!("bound to {}", host.hostname),
            ) {
                warn!(task_id = %task.id, error = %e, "placed transition failed");
            }
            if let Some(handle) = self.tracker.get_task(&task.id) {
                handle.lock().unwrap().record_placement_success();
            }
        }
        self.metrics.placements_total.fetch_add(1, Ordering::Relaxed);

        let placement = Placement {
            task_type: gang.task_type(),
            gang,
            hostname: host.hostname.clone(),
            agent_id: host.agent_id.clone(),
            ports,
        };
        debug!(host = %placement.hostname, tasks = placement.gang.tasks.len(), "gang placed");

        // Launch failures are handled inside the launcher (offers
        // released, gang re-enqueued); nothing more to do here.
        if let Err(e) = self.launcher.process_placement(placement).await {
            warn!(error = %e, "launch after placement failed");
        }
    }

    /// No host matched within the budget: back the tasks off and return
    /// the gang to the ready queue.
    async fn return_to_scheduler(&self, gang: Gang) {
        let mut not_before_ms = 0u64;
        for task in &gang.tasks {
            if let Some(handle) = self.tracker.get_task(&task.id) {
                let backoff = handle.lock().unwrap().record_placement_failure();
                not_before_ms = not_before_ms.max(epoch_millis() + backoff.as_millis() as u64);
            }
            if let Err(e) = self.tracker.transition(
                &task.id,
                TaskState::Ready,
                "no_hosts_matched",
                "returning to scheduler with backoff",
            ) {
                debug!(task_id = %task.id, error = %e, "ready transition skipped");
            }
        }
        self.metrics
            .placement_retries_total
            .fetch_add(1, Ordering::Relaxed);
        debug!(tasks = gang.tasks.len(), not_before_ms, "gang returned to scheduler");
        if let Err(e) = self.tree.requeue_ready(gang, not_before_ms) {
            warn!(error = %e, "re-enqueue after failed placement");
        }
    }
}

/// Translate a gang's needs into a host filter.
fn build_filter(gang: &Gang, fanout: u32) -> HostFilter {
    let constraints: Vec<Constraint> = gang
        .tasks
        .iter()
        .filter_map(|t| t.spec.constraint.clone())
        .collect();
    let constraint = match constraints.len() {
        0 => None,
        1 => constraints.into_iter().next(),
        _ => Some(Constraint::And { constraints }),
    };
    HostFilter {
        minimum: gang.demand(),
        num_ports: gang.ports_needed(),
        constraint,
        max_hosts: fanout,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regatta_core::{new_cm_task_id, Resources, TaskDesc, TaskSpec};

    fn make_gang(ids: &[&str], cpu: f64) -> Gang {
        let tasks = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let mut spec = TaskSpec::default();
                spec.resources.scalar = Resources::new(cpu, 0.0, 0.0, 0.0);
                spec.resources.num_ports = 1;
                TaskDesc {
                    id: id.to_string(),
                    job_id: "j".to_string(),
                    instance_idx: i as u32,
                    task_type: TaskType::Batch,
                    respool_id: "leaf".to_string(),
                    priority: 1,
                    preemptible: true,
                    spec,
                    cm_task_id: new_cm_task_id(id),
                }
            })
            .collect();
        Gang::of(tasks)
    }

    #[test]
    fn filter_reflects_gang_needs() {
        let gang = make_gang(&["j-0", "j-1"], 2.0);
        let filter = build_filter(&gang, 3);

        assert_eq!(filter.minimum.cpu, 4.0);
        assert_eq!(filter.num_ports, 2);
        assert_eq!(filter.max_hosts, 3);
        assert!(filter.constraint.is_none());
    }

    #[test]
    fn filter_merges_constraints() {
        let mut gang = make_gang(&["j-0", "j-1"], 1.0);
        gang.tasks[0].spec.constraint = Some(Constraint::HostLabel {
            key: "zone".into(),
            value: "a".into(),
        });
        gang.tasks[1].spec.constraint = Some(Constraint::HostLabel {
            key: "rack".into(),
            value: "r1".into(),
        });

        let filter = build_filter(&gang, 1);
        assert!(matches!(filter.constraint, Some(Constraint::And { .. })));
    }
}
