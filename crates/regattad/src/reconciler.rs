//! Periodic task reconciliation.
//!
//! Re-syncs task state with the cluster manager to repair divergence:
//! every period, the CM is asked to re-send status for every attempt the
//! tracker believes is live. Gated by the leader-gated server, so it only
//! runs while this node holds the subscription.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use regatta_cluster::{ClusterManagerClient, Handler};
use regatta_core::TaskState;
use regatta_task::Tracker;

/// States worth reconciling: the CM has (or should have) an attempt.
const LIVE_STATES: [TaskState; 5] = [
    TaskState::Launching,
    TaskState::Launched,
    TaskState::Starting,
    TaskState::Running,
    TaskState::Killing,
];

pub struct TaskReconciler {
    tracker: Arc<Tracker>,
    cm: Arc<dyn ClusterManagerClient>,
    period: Duration,
    stop: Mutex<Option<watch::Sender<bool>>>,
}

impl TaskReconciler {
    pub fn new(
        tracker: Arc<Tracker>,
        cm: Arc<dyn ClusterManagerClient>,
        period: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            tracker,
            cm,
            period,
            stop: Mutex::new(None),
        })
    }

    /// CM ids of every attempt the tracker considers live.
    fn live_cm_task_ids(&self) -> Vec<String> {
        let by_state = self.tracker.active_tasks(None, &LIVE_STATES);
        by_state
            .values()
            .flatten()
            .filter_map(|id| self.tracker.get_task(id))
            .map(|handle| handle.lock().unwrap().desc().cm_task_id.clone())
            .collect()
    }

    async fn run_once(&self) {
        let ids = self.live_cm_task_ids();
        debug!(tasks = ids.len(), "reconciling task state");
        if let Err(e) = self.cm.reconcile(ids).await {
            warn!(error = %e, "reconciliation request failed");
        }
    }
}

#[async_trait]
impl Handler for TaskReconciler {
    fn name(&self) -> &str {
        "task-reconciler"
    }

    async fn start(&self) {
        let (tx, mut rx) = watch::channel(false);
        {
            let mut stop = self.stop.lock().unwrap();
            if let Some(old) = stop.replace(tx) {
                let _ = old.send(true);
            }
        }

        let tracker = self.tracker.clone();
        let cm = self.cm.clone();
        let period = self.period;
        tokio::spawn(async move {
            let reconciler = TaskReconciler {
                tracker,
                cm,
                period,
                stop: Mutex::new(None),
            };
            // Implicit reconciliation first: let the CM stream everything.
            if let Err(e) = reconciler.cm.reconcile(Vec::new()).await {
                warn!(error = %e, "implicit reconciliation failed");
            }
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => reconciler.run_once().await,
                    _ = rx.changed() => break,
                }
            }
            info!("task reconciler stopped");
        });
        info!(period_secs = self.period.as_secs(), "task reconciler started");
    }

    async fn stop(&self) {
        if let Some(tx) = self.stop.lock().unwrap().take() {
            let _ = tx.send(true);
        }
    }
}
