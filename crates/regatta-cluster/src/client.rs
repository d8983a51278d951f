//! Cluster-manager client surface.
//!
//! The wire codec and HTTP transport live outside this crate; components
//! talk to the CM through this trait. Rejections surface as
//! `Error::CmReject` so the launcher can apply its per-kind policy.

use async_trait::async_trait;

use regatta_core::{PersistentVolume, Resources, Result, TaskId, TaskSpec};

/// One task as handed to the CM in a launch request.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchableTask {
    pub task_id: TaskId,
    pub cm_task_id: String,
    pub spec: TaskSpec,
    /// Ports assigned out of the backing offer.
    pub ports: Vec<u16>,
}

/// An operation nested inside an offer-operations request. The CM applies
/// the sequence atomically against the offers backing it.
#[derive(Debug, Clone, PartialEq)]
pub enum OfferOperation {
    Reserve { resources: Resources },
    Create { volume: PersistentVolume },
    Launch { tasks: Vec<LaunchableTask> },
    Destroy { volume_id: String },
    Unreserve { resources: Resources },
}

/// Calls the control plane makes against the cluster manager.
#[async_trait]
pub trait ClusterManagerClient: Send + Sync {
    /// Launch tasks on the offers currently held for a host.
    async fn launch_tasks(
        &self,
        hostname: &str,
        agent_id: &str,
        tasks: Vec<LaunchableTask>,
    ) -> Result<()>;

    /// Apply an ordered operation sequence (reserve/create/launch/...)
    /// against a host's offers.
    async fn offer_operations(
        &self,
        hostname: &str,
        agent_id: &str,
        operations: Vec<OfferOperation>,
    ) -> Result<()>;

    async fn kill_task(&self, cm_task_id: &str) -> Result<()>;

    /// Return unused offers to the CM.
    async fn decline_offers(&self, offer_ids: Vec<String>) -> Result<()>;

    /// Ask the CM to re-send status for the given task attempts
    /// (empty = implicit reconciliation of everything).
    async fn reconcile(&self, cm_task_ids: Vec<String>) -> Result<()>;

    /// Acknowledge a status update offset.
    async fn acknowledge(&self, cm_task_id: &str, offset: u64) -> Result<()>;
}
