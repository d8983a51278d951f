//! Task launcher.
//!
//! Turns placements into cluster-manager requests. Stateless tasks go
//! through `launch_tasks`; stateful tasks with a persistent volume go
//! through an offer-operations sequence (RESERVE -> CREATE -> LAUNCH,
//! trimmed when the volume or reservation already exists). Before a
//! launch, each task's runtime is reloaded from the store, rewritten with
//! the bound host and ports, and persisted with transient-error retry.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use regatta_cluster::{ClusterManagerClient, LaunchableTask, OfferOperation};
use regatta_core::metrics::SchedulerMetrics;
use regatta_core::{
    CmRejectKind, Error, Placement, PersistentVolume, Result, RetryPolicy, TaskId, TaskState,
    VolumeState,
};
use regatta_offerpool::OfferPool;
use regatta_respool::PoolTree;
use regatta_state::{StoreError, TaskStore, VolumeStore};
use regatta_task::Tracker;

/// Notified with tasks the goal-state driver should reconsider.
pub type TaskNotifier = Arc<dyn Fn(&TaskId) + Send + Sync>;

/// Reason recorded when the launcher rewrites a runtime with its offer.
const REASON_UPDATE_OFFER: &str = "UPDATE_OFFER";
/// Reason recorded when a gang bounces off rejected offers.
const REASON_HOST_REJECT_OFFER: &str = "HOST_REJECT_OFFER";

pub struct Launcher {
    tasks: Arc<dyn TaskStore>,
    volumes: Arc<dyn VolumeStore>,
    cm: Arc<dyn ClusterManagerClient>,
    tracker: Arc<Tracker>,
    tree: Arc<PoolTree>,
    offers: Arc<OfferPool>,
    metrics: Arc<SchedulerMetrics>,
    retry: RetryPolicy,
    notifier: Option<TaskNotifier>,
}

impl Launcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        volumes: Arc<dyn VolumeStore>,
        cm: Arc<dyn ClusterManagerClient>,
        tracker: Arc<Tracker>,
        tree: Arc<PoolTree>,
        offers: Arc<OfferPool>,
        metrics: Arc<SchedulerMetrics>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            tasks,
            volumes,
            cm,
            tracker,
            tree,
            offers,
            metrics,
            retry,
            notifier: None,
        }
    }

    /// Wire the goal-state poke. Set once at startup.
    pub fn with_notifier(mut self, notifier: TaskNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    fn notify(&self, task_id: &TaskId) {
        if let Some(notifier) = &self.notifier {
            notifier(task_id);
        }
    }

    /// Launch a placement end to end.
    pub async fn process_placement(&self, placement: Placement) -> Result<()> {
        let hostname = placement.hostname.clone();

        let launchable = self.prepare_tasks(&placement).await;
        if launchable.is_empty() {
            // Everything was filtered out; the claimed offers must still
            // be surrendered so the host does not stay in Placing.
            debug!(host = %hostname, "placement emptied before launch; releasing offers");
            self.offers.release_host_offers(&[hostname]);
            return Ok(());
        }

        match self.launch(&placement, launchable.clone()).await {
            Ok(()) => {
                for task in &launchable {
                    let _ = self.tracker.transition(
                        &task.task_id,
                        TaskState::Launched,
                        REASON_UPDATE_OFFER,
                        "accepted by cluster manager",
                    );
                    self.notify(&task.task_id);
                }
                self.metrics.launches_total.fetch_add(1, Ordering::Relaxed);
                self.offers.consume_host_offers(&[placement.hostname.clone()]);
                info!(host = %placement.hostname, tasks = launchable.len(), "gang launched");
                Ok(())
            }
            Err(e) => {
                self.metrics
                    .launch_failures_total
                    .fetch_add(1, Ordering::Relaxed);
                self.handle_launch_failure(&placement, &e).await;
                Err(e)
            }
        }
    }

    /// Reload, filter and rewrite each task of the gang, returning the
    /// set that is actually launchable.
    async fn prepare_tasks(&self, placement: &Placement) -> Vec<LaunchableTask> {
        let mut launchable = Vec::new();
        let mut next_port = 0usize;

        for task in &placement.gang.tasks {
            let runtime = match regatta_core::retry(&self.retry, "reload task runtime", || async move {
                self.tasks
                    .get_task_by_id(&task.id)
                    .await
                    .map_err(Error::from)
            })
            .await
            {
                Ok(rt) => rt,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "dropping task from launch: runtime unreadable");
                    continue;
                }
            };

            if runtime.goal_state == TaskState::Killed {
                // Killed while travelling through placement: never launch,
                // let the goal-state driver finish the kill.
                info!(task_id = %task.id, "skipping launch of killed task");
                self.notify(&task.id);
                continue;
            }

            let ports: Vec<u16> = placement
                .ports
                .iter()
                .skip(next_port)
                .take(task.spec.resources.num_ports as usize)
                .copied()
                .collect();
            next_port += task.spec.resources.num_ports as usize;

            let mut updated = runtime.clone();
            updated.host = Some(placement.hostname.clone());
            updated.agent_id = Some(placement.agent_id.clone());
            updated.ports = ports.clone();
            updated.state = TaskState::Launched;
            updated.reason = REASON_UPDATE_OFFER.to_string();
            updated.message = "Add hostname and ports".to_string();

            let persisted = regatta_core::retry(&self.retry, "persist launch runtime", || {
                let updated = updated.clone();
                async move {
                    self.tasks
                        .update_task_runtime(&task.id, &updated)
                        .await
                        .map_err(Error::from)
                }
            })
            .await;

            if let Err(e) = persisted {
                warn!(task_id = %task.id, error = %e, "dropping task from launch: runtime write failed");
                continue;
            }

            let _ = self.tracker.transition(
                &task.id,
                TaskState::Launching,
                REASON_UPDATE_OFFER,
                "handed to launcher",
            );

            launchable.push(LaunchableTask {
                task_id: task.id.clone(),
                cm_task_id: task.cm_task_id.clone(),
                spec: task.spec.clone(),
                ports,
            });
        }
        launchable
    }

    /// Issue the CM request, retrying retriable rejections.
    async fn launch(&self, placement: &Placement, tasks: Vec<LaunchableTask>) -> Result<()> {
        let volume_spec = placement
            .gang
            .tasks
            .iter()
            .find_map(|t| t.spec.volume.as_ref().map(|v| (t, v.clone())));

        let mut attempt = 0u32;
        loop {
            let result = match &volume_spec {
                None => {
                    self.cm
                        .launch_tasks(&placement.hostname, &placement.agent_id, tasks.clone())
                        .await
                }
                Some((task, volume)) => {
                    let ops = self
                        .stateful_operations(task, volume, placement, tasks.clone())
                        .await?;
                    self.cm
                        .offer_operations(&placement.hostname, &placement.agent_id, ops)
                        .await
                }
            };

            match result {
                Ok(()) => return Ok(()),
                // Rejected offers are dead; retrying the same request is useless.
                Err(e @ Error::CmReject {
                    kind: CmRejectKind::InvalidOffers,
                    ..
                }) => return Err(e),
                Err(e @ Error::CmReject { .. }) | Err(e @ Error::Transient(_)) => {
                    attempt += 1;
                    if attempt >= self.retry.max_attempts {
                        return Err(e);
                    }
                    let backoff = self.retry.backoff_for_attempt(attempt - 1);
                    debug!(attempt, error = %e, "retrying launch");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Build the operation sequence for a stateful task.
    ///
    /// A volume already in Created state needs only the launch; a task
    /// already bound to this agent launches on its reserved offer; fresh
    /// volumes get the full RESERVE -> CREATE -> LAUNCH sequence.
    async fn stateful_operations(
        &self,
        task: &regatta_core::TaskDesc,
        volume: &regatta_core::VolumeSpec,
        placement: &Placement,
        tasks: Vec<LaunchableTask>,
    ) -> Result<Vec<OfferOperation>> {
        let volume_id = format!("{}-{}", task.job_id, task.instance_idx);
        let existing = match self.volumes.get_persistent_volume(&volume_id).await {
            Ok(v) => Some(v),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        if existing
            .as_ref()
            .is_some_and(|v| v.state == VolumeState::Created)
        {
            return Ok(vec![OfferOperation::Launch { tasks }]);
        }

        let runtime = self
            .tasks
            .get_task_by_id(&task.id)
            .await
            .map_err(Error::from)?;
        let reserved_here = !runtime.prev_cm_task_ids.is_empty()
            && runtime.agent_id.as_deref() == Some(placement.agent_id.as_str());
        if reserved_here && existing.is_some() {
            return Ok(vec![OfferOperation::Launch { tasks }]);
        }

        let record = PersistentVolume {
            id: volume_id.clone(),
            job_id: task.job_id.clone(),
            instance_idx: task.instance_idx,
            container_path: volume.container_path.clone(),
            size_mb: volume.size_mb,
            state: VolumeState::Initialized,
        };
        if existing.is_none() {
            self.volumes
                .create_persistent_volume(&record)
                .await
                .map_err(Error::from)?;
        }

        Ok(vec![
            OfferOperation::Reserve {
                resources: task.spec.resources.scalar,
            },
            OfferOperation::Create {
                volume: PersistentVolume {
                    state: VolumeState::Created,
                    ..record
                },
            },
            OfferOperation::Launch { tasks },
        ])
    }

    /// Apply the per-kind rejection policy after a failed launch.
    async fn handle_launch_failure(&self, placement: &Placement, error: &Error) {
        let hostname = placement.hostname.clone();
        self.offers.release_host_offers(&[hostname.clone()]);

        let regenerate = matches!(
            error,
            Error::CmReject {
                kind: CmRejectKind::InvalidOffers,
                ..
            }
        );

        let mut requeued = placement.gang.clone();
        for task in &mut requeued.tasks {
            let Ok(mut runtime) = self.tasks.get_task_by_id(&task.id).await else {
                continue;
            };
            runtime.state = TaskState::Ready;
            runtime.fail_count += 1;
            runtime.host = None;
            runtime.agent_id = None;
            runtime.ports.clear();
            runtime.reason = REASON_HOST_REJECT_OFFER.to_string();
            runtime.message = "Regenerate placement".to_string();
            if regenerate {
                runtime.regenerate_cm_task_id(&task.id);
                task.cm_task_id = runtime.cm_task_id.clone();
                if let Some(handle) = self.tracker.get_task(&task.id) {
                    handle.lock().unwrap().set_cm_task_id(runtime.cm_task_id.clone());
                }
            }
            let _ = self.tasks.update_task_runtime(&task.id, &runtime).await;

            let _ = self.tracker.transition(
                &task.id,
                TaskState::Ready,
                REASON_HOST_REJECT_OFFER,
                "launch failed; returning to scheduler",
            );
            self.tracker.clear_placement(&task.id);
        }

        warn!(
            host = %placement.hostname,
            error = %error,
            "launch failed; gang re-enqueued"
        );
        if let Err(e) = self.tree.requeue_ready(requeued, 0) {
            warn!(error = %e, "failed to re-enqueue gang after launch failure");
        }
    }
}
