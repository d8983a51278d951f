//! In-process cluster-manager stand-in.
//!
//! Standalone mode runs the whole control plane in one process with no
//! external CM. The loopback client accepts every request and streams
//! back the status updates a healthy CM would send, slightly deferred so
//! the caller finishes its own bookkeeping first. Production deployments
//! plug a real transport into the same traits.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use regatta_cluster::{
    ClusterManagerClient, Connection, Event, Handler, LaunchableTask, LeaderDetector,
    OfferOperation, StatusUpdate,
};
use regatta_core::{Result, TaskState};

use crate::events::EventProcessor;

/// How long the loopback waits before streaming a synthesized update.
const EMIT_DELAY: Duration = Duration::from_millis(20);

/// Always elects the local endpoint as the CM leader.
pub struct LoopbackDetector;

impl LeaderDetector for LoopbackDetector {
    fn host_port(&self) -> Option<String> {
        Some("127.0.0.1:0".to_string())
    }
}

/// A connection that is up whenever it has been started.
#[derive(Default)]
pub struct LoopbackConnection {
    running: AtomicBool,
}

#[async_trait]
impl Connection for LoopbackConnection {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
    async fn start(&self, _leader_host_port: &str) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }
    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// A no-op gated handler slot (reconciler, event pump) for standalone mode.
pub struct NoopHandler(pub &'static str);

#[async_trait]
impl Handler for NoopHandler {
    fn name(&self) -> &str {
        self.0
    }
    async fn start(&self) {}
    async fn stop(&self) {}
}

/// Loopback CM client: every launched task starts running shortly after
/// the launch call returns, and every kill lands.
pub struct LoopbackCm {
    processor: OnceLock<Arc<EventProcessor>>,
    offset: AtomicU64,
    kills: Mutex<Vec<String>>,
}

impl LoopbackCm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            processor: OnceLock::new(),
            offset: AtomicU64::new(0),
            kills: Mutex::new(Vec::new()),
        })
    }

    /// Wire the event processor that receives the synthesized stream.
    pub fn set_processor(&self, processor: Arc<EventProcessor>) {
        let _ = self.processor.set(processor);
    }

    /// CM task ids this loopback was asked to kill.
    pub fn killed(&self) -> Vec<String> {
        self.kills.lock().unwrap().clone()
    }

    fn next_offset(&self) -> u64 {
        self.offset.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Stream updates after the in-flight CM call has returned.
    fn schedule_updates(&self, updates: Vec<(String, TaskState, &'static str, u64)>) {
        let Some(processor) = self.processor.get().cloned() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(EMIT_DELAY).await;
            for (cm_task_id, state, reason, offset) in updates {
                processor
                    .handle_event(Event::Update(StatusUpdate {
                        cm_task_id,
                        state,
                        reason: reason.to_string(),
                        message: String::new(),
                        offset,
                        agent_id: None,
                    }))
                    .await;
            }
        });
    }

    fn schedule_started(&self, tasks: &[LaunchableTask]) {
        let mut updates = Vec::new();
        for task in tasks {
            updates.push((
                task.cm_task_id.clone(),
                TaskState::Starting,
                "loopback_start",
                self.next_offset(),
            ));
            updates.push((
                task.cm_task_id.clone(),
                TaskState::Running,
                "loopback_run",
                self.next_offset(),
            ));
        }
        self.schedule_updates(updates);
    }
}

#[async_trait]
impl ClusterManagerClient for LoopbackCm {
    async fn launch_tasks(
        &self,
        hostname: &str,
        _agent_id: &str,
        tasks: Vec<LaunchableTask>,
    ) -> Result<()> {
        debug!(host = %hostname, tasks = tasks.len(), "loopback launch");
        self.schedule_started(&tasks);
        Ok(())
    }

    async fn offer_operations(
        &self,
        hostname: &str,
        _agent_id: &str,
        operations: Vec<OfferOperation>,
    ) -> Result<()> {
        debug!(host = %hostname, ops = operations.len(), "loopback offer operations");
        for op in &operations {
            if let OfferOperation::Launch { tasks } = op {
                self.schedule_started(tasks);
            }
        }
        Ok(())
    }

    async fn kill_task(&self, cm_task_id: &str) -> Result<()> {
        self.kills.lock().unwrap().push(cm_task_id.to_string());
        self.schedule_updates(vec![(
            cm_task_id.to_string(),
            TaskState::Killed,
            "loopback_kill",
            self.next_offset(),
        )]);
        Ok(())
    }

    async fn decline_offers(&self, offer_ids: Vec<String>) -> Result<()> {
        debug!(count = offer_ids.len(), "loopback decline");
        Ok(())
    }

    async fn reconcile(&self, _cm_task_ids: Vec<String>) -> Result<()> {
        Ok(())
    }

    async fn acknowledge(&self, _cm_task_id: &str, _offset: u64) -> Result<()> {
        Ok(())
    }
}
