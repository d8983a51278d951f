//! Merged daemon configuration.
//!
//! One YAML file with a section per subsystem. Every field has a default
//! so a partial file (or none at all) yields a runnable configuration.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::TaskType;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub metrics: MetricsConfig,
    pub election: ElectionConfig,
    pub cluster_manager: ClusterManagerConfig,
    pub storage: StorageConfig,
    pub placement: PlacementConfig,
    pub host_manager: HostManagerConfig,
    pub res_manager: ResManagerConfig,
    pub job_manager: JobManagerConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Leader-election parameters. The election library itself is an external
/// collaborator; these settings are handed to it verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    pub zk_servers: Vec<String>,
    pub root: String,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            zk_servers: vec!["localhost:2181".to_string()],
            root: "/regatta".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterManagerConfig {
    /// Coordination-service path where the CM leader is published.
    pub zk_path: String,
    pub framework_name: String,
    pub framework_role: String,
    /// Content encoding negotiated on the event stream.
    pub encoding: String,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ClusterManagerConfig {
    fn default() -> Self {
        Self {
            zk_path: "/cm/leader".to_string(),
            framework_name: "regatta".to_string(),
            framework_role: "*".to_string(),
            encoding: "x-protobuf".to_string(),
            min_backoff_ms: 500,
            max_backoff_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Chosen backend: currently `redb` (embedded) or `memory`.
    pub backend: String,
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "redb".to_string(),
            path: "/var/lib/regatta/regatta.redb".to_string(),
        }
    }
}

/// Placement strategy selected per deployment of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStrategyKind {
    /// First host that satisfies the filter wins.
    Batch,
    /// Rank candidate hosts by a weighted bin-packing score.
    #[serde(alias = "mimir")]
    Scored,
}

/// Per-task-type table of maximum successful placement rounds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxRoundsConfig {
    pub unknown: u32,
    pub batch: u32,
    pub stateless: u32,
    pub daemon: u32,
    pub stateful: u32,
}

impl MaxRoundsConfig {
    /// 0 means no round limit for that type.
    pub fn value(&self, t: TaskType) -> u32 {
        match t {
            TaskType::Unknown => self.unknown,
            TaskType::Batch => self.batch,
            TaskType::Stateless => self.stateless,
            TaskType::Daemon => self.daemon,
            TaskType::Stateful => self.stateful,
        }
    }
}

/// Per-task-type table of maximum placement durations, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxDurationsConfig {
    pub unknown_ms: u64,
    pub batch_ms: u64,
    pub stateless_ms: u64,
    pub daemon_ms: u64,
    pub stateful_ms: u64,
}

impl Default for MaxDurationsConfig {
    fn default() -> Self {
        Self {
            unknown_ms: 30_000,
            batch_ms: 30_000,
            stateless_ms: 30_000,
            daemon_ms: 30_000,
            stateful_ms: 60_000,
        }
    }
}

impl MaxDurationsConfig {
    pub fn value(&self, t: TaskType) -> Duration {
        let ms = match t {
            TaskType::Unknown => self.unknown_ms,
            TaskType::Batch => self.batch_ms,
            TaskType::Stateless => self.stateless_ms,
            TaskType::Daemon => self.daemon_ms,
            TaskType::Stateful => self.stateful_ms,
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    pub strategy: PlacementStrategyKind,
    /// Worker concurrency inside one placement engine.
    pub concurrency: usize,
    /// Max gangs dequeued per request to the ready queue.
    pub task_dequeue_limit: usize,
    pub task_dequeue_timeout_ms: u64,
    pub max_rounds: MaxRoundsConfig,
    pub max_durations: MaxDurationsConfig,
    /// Task types this daemon runs a placement engine for.
    pub task_types: Vec<TaskType>,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            strategy: PlacementStrategyKind::Batch,
            concurrency: 4,
            task_dequeue_limit: 10,
            task_dequeue_timeout_ms: 100,
            max_rounds: MaxRoundsConfig::default(),
            max_durations: MaxDurationsConfig::default(),
            task_types: vec![TaskType::Batch, TaskType::Stateless, TaskType::Stateful],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostManagerConfig {
    /// How long an unused offer is held before being declined back.
    pub offer_hold_secs: u64,
    /// Period of the offer pruner.
    pub pruning_period_secs: u64,
    /// Buffer size of the task status-update channel.
    pub task_update_buffer: usize,
}

impl Default for HostManagerConfig {
    fn default() -> Self {
        Self {
            offer_hold_secs: 300,
            pruning_period_secs: 60,
            task_update_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResManagerConfig {
    pub port: u16,
    /// Capacity distributed from the root pool, also its reservation.
    pub cluster_capacity: crate::resources::Resources,
    pub scheduling_period_ms: u64,
    pub entitlement_refresh_ms: u64,
    /// Capacity of each pool's ready queue.
    pub ready_queue_limit: usize,
    /// Placement backoff bounds for "no host matched" retries.
    pub placement_min_backoff_ms: u64,
    pub placement_max_backoff_ms: u64,
    /// Dwell timeouts for non-terminal states.
    pub placing_timeout_ms: u64,
    pub launching_timeout_ms: u64,
    pub preempting_timeout_ms: u64,
}

impl Default for ResManagerConfig {
    fn default() -> Self {
        Self {
            port: 5290,
            cluster_capacity: crate::resources::Resources::new(
                1_000.0,
                4_000_000.0,
                16_000_000.0,
                64.0,
            ),
            scheduling_period_ms: 100,
            entitlement_refresh_ms: 1_000,
            ready_queue_limit: 1_000,
            placement_min_backoff_ms: 1_000,
            placement_max_backoff_ms: 60_000,
            placing_timeout_ms: 10 * 60 * 1_000,
            launching_timeout_ms: 20 * 60 * 1_000,
            preempting_timeout_ms: 10 * 60 * 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobManagerConfig {
    /// Goal-state driver worker pool size.
    pub worker_count: usize,
    /// Default delay before a re-enqueued entity is reconsidered.
    pub requeue_delay_ms: u64,
    /// Max launch/run retries before a task is failed terminally.
    pub max_task_retries: u32,
    /// Store write retry policy (launcher + driver).
    pub retry_max_attempts: u32,
    pub retry_min_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            requeue_delay_ms: 1_000,
            max_task_retries: 3,
            retry_max_attempts: 5,
            retry_min_backoff_ms: 100,
            retry_max_backoff_ms: 10_000,
        }
    }
}

impl JobManagerConfig {
    pub fn retry_policy(&self) -> crate::retry::RetryPolicy {
        crate::retry::RetryPolicy {
            max_attempts: self.retry_max_attempts,
            min_backoff: Duration::from_millis(self.retry_min_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            max_elapsed: Duration::ZERO,
        }
    }
}

/// Free-form label map attached to the framework registration.
pub type FrameworkLabels = HashMap<String, String>;
