//! Events received on the cluster-manager subscription stream.

use serde::{Deserialize, Serialize};

use regatta_core::{HostOffer, TaskState};

/// A task status update from the cluster manager.
///
/// Updates for one task carry monotone offsets; the stream handler drops
/// anything at or below the last acknowledged offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// The CM's id for the task attempt this update is about.
    pub cm_task_id: String,
    pub state: TaskState,
    pub reason: String,
    pub message: String,
    /// Monotone per-task offset for ordering and acknowledgement.
    pub offset: u64,
    #[serde(default)]
    pub agent_id: Option<String>,
}

/// A streamed event from the cluster manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Subscribed {
        framework_id: String,
        heartbeat_interval_secs: u64,
    },
    Offers {
        offers: Vec<HostOffer>,
    },
    Rescind {
        offer_id: String,
    },
    Update(StatusUpdate),
    Failure {
        agent_id: Option<String>,
        message: String,
    },
    Heartbeat,
}
