//! Subscription event processing.
//!
//! Applies streamed cluster-manager events to the in-memory state:
//! offers land in the offer pool, rescinds remove them, and status
//! updates drive the per-task state machines. This is the only writer of
//! the Starting/Running states; the launcher is the only writer of
//! Launched. Updates are processed in offset-monotone order per task and
//! acknowledged after they are applied.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use regatta_cluster::{ClusterManagerClient, Event, StatusUpdate};
use regatta_core::{cm_task_id_to_task_id, TaskState};
use regatta_goalstate::GoalStateDriver;
use regatta_offerpool::OfferPool;
use regatta_state::{FrameworkInfoStore, TaskStore};
use regatta_task::Tracker;

pub struct EventProcessor {
    offers: Arc<OfferPool>,
    tracker: Arc<Tracker>,
    tasks: Arc<dyn TaskStore>,
    framework: Arc<dyn FrameworkInfoStore>,
    driver: Arc<GoalStateDriver>,
    cm: Arc<dyn ClusterManagerClient>,
    /// Highest acknowledged offset per CM task id.
    offsets: Mutex<HashMap<String, u64>>,
}

impl EventProcessor {
    pub fn new(
        offers: Arc<OfferPool>,
        tracker: Arc<Tracker>,
        tasks: Arc<dyn TaskStore>,
        framework: Arc<dyn FrameworkInfoStore>,
        driver: Arc<GoalStateDriver>,
        cm: Arc<dyn ClusterManagerClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            offers,
            tracker,
            tasks,
            framework,
            driver,
            cm,
            offsets: Mutex::new(HashMap::new()),
        })
    }

    pub async fn handle_event(&self, event: Event) {
        match event {
            Event::Subscribed {
                framework_id,
                heartbeat_interval_secs,
            } => {
                info!(%framework_id, heartbeat_interval_secs, "subscribed to cluster manager");
                if let Err(e) = self.framework.set_framework_id(&framework_id).await {
                    warn!(error = %e, "failed to persist framework id");
                }
            }
            Event::Offers { offers } => {
                debug!(count = offers.len(), "offers received");
                self.offers.add_offers(offers);
            }
            Event::Rescind { offer_id } => {
                self.offers.rescind_offer(&offer_id);
            }
            Event::Update(update) => self.handle_status_update(update).await,
            Event::Failure { agent_id, message } => {
                warn!(?agent_id, %message, "cluster manager reported failure");
            }
            Event::Heartbeat => {}
        }
    }

    /// Apply one task status update.
    async fn handle_status_update(&self, update: StatusUpdate) {
        // Enforce per-task offset monotonicity.
        {
            let mut offsets = self.offsets.lock().unwrap();
            let last = offsets.get(&update.cm_task_id).copied().unwrap_or(0);
            if update.offset <= last && last != 0 {
                debug!(cm_task_id = %update.cm_task_id, offset = update.offset, "dropping stale status offset");
                return;
            }
            offsets.insert(update.cm_task_id.clone(), update.offset);
        }

        let Some(task_id) = cm_task_id_to_task_id(&update.cm_task_id) else {
            warn!(cm_task_id = %update.cm_task_id, "unparseable cluster-manager task id");
            return;
        };

        // The tracker view decides staleness across attempts.
        let tracked_cm_id = self
            .tracker
            .get_task(&task_id)
            .map(|h| h.lock().unwrap().desc().cm_task_id.clone());
        if tracked_cm_id.as_deref().is_some_and(|id| id != update.cm_task_id) {
            warn!(task_id = %task_id, "dropping status update for an earlier attempt");
            return;
        }

        if let Err(e) = self.tracker.transition(
            &task_id,
            update.state,
            &update.reason,
            &update.message,
        ) {
            debug!(task_id = %task_id, error = %e, "status transition not applied in tracker");
        }

        // Persist against the same attempt we observed.
        match self.tasks.get_task_by_id(&task_id).await {
            Ok(mut runtime) => {
                if runtime.cm_task_id == update.cm_task_id {
                    runtime.state = update.state;
                    runtime.reason = update.reason.clone();
                    runtime.message = update.message.clone();
                    if update.state == TaskState::Failed {
                        runtime.fail_count += 1;
                    }
                    if let Some(agent_id) = &update.agent_id {
                        runtime.agent_id = Some(agent_id.clone());
                    }
                    if let Err(e) = self
                        .tasks
                        .update_task_runtime_if_cm_id(&task_id, &runtime, &update.cm_task_id)
                        .await
                    {
                        warn!(task_id = %task_id, error = %e, "status update not persisted");
                    }
                }
            }
            Err(e) => warn!(task_id = %task_id, error = %e, "task runtime unreadable for status update"),
        }

        if update.state.is_terminal() {
            // Return resources and let the driver converge the task/job.
            let _ = self.tracker.mark_done(&task_id, &update.cm_task_id);
            self.driver.enqueue_task(&task_id, Duration::ZERO);
        }

        if let Err(e) = self.cm.acknowledge(&update.cm_task_id, update.offset).await {
            warn!(cm_task_id = %update.cm_task_id, error = %e, "status acknowledge failed");
        }
    }
}
