//! Domain types shared across the control plane.
//!
//! Jobs, tasks, gangs, offers, placements and volumes. All types are
//! serializable to/from JSON for persistence and for the REST surface.
//! Cross-component references are carried as ids, never as handles.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::resources::Resources;

/// Unique identifier for a job (uuid v4).
pub type JobId = String;

/// Unique identifier for a task: `{job_id}-{instance_idx}`.
pub type TaskId = String;

/// Unique identifier for a resource pool.
pub type PoolId = String;

/// Build the composite task id for a job instance.
pub fn task_id(job_id: &str, instance_idx: u32) -> TaskId {
    format!("{job_id}-{instance_idx}")
}

/// Split a task id back into `(job_id, instance_idx)`.
///
/// The job id itself contains dashes, so the instance index is the
/// final dash-separated component.
pub fn parse_task_id(id: &str) -> Option<(JobId, u32)> {
    let (job, idx) = id.rsplit_once('-')?;
    let idx = idx.parse().ok()?;
    Some((job.to_string(), idx))
}

/// Mint a fresh cluster-manager task id for a launch attempt.
///
/// The instance identity (`TaskId`) is stable across retries; the CM id
/// changes on every re-launch so stale status updates can be told apart.
pub fn new_cm_task_id(task_id: &str) -> String {
    format!("{task_id}-{}", uuid::Uuid::new_v4())
}

/// Recover the stable task id from a CM task id minted by
/// [`new_cm_task_id`] (the trailing component is a 36-char uuid).
pub fn cm_task_id_to_task_id(cm_task_id: &str) -> Option<TaskId> {
    const UUID_LEN: usize = 36;
    if cm_task_id.len() <= UUID_LEN + 1 {
        return None;
    }
    let split = cm_task_id.len() - UUID_LEN - 1;
    if cm_task_id.as_bytes()[split] != b'-' {
        return None;
    }
    Some(cm_task_id[..split].to_string())
}

// ── Jobs ───────────────────────────────────────────────────────────

/// Workload category of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Batch,
    Service,
    Stateless,
    Stateful,
    Daemon,
}

/// Task category used by the scheduler, placement engines and tracker.
///
/// `Unknown` means "all types" in query positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Unknown,
    Batch,
    Stateless,
    Daemon,
    Stateful,
}

impl From<JobType> for TaskType {
    fn from(jt: JobType) -> Self {
        match jt {
            JobType::Batch => TaskType::Batch,
            JobType::Service | JobType::Stateless => TaskType::Stateless,
            JobType::Stateful => TaskType::Stateful,
            JobType::Daemon => TaskType::Daemon,
        }
    }
}

/// Service-level agreement attached to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sla {
    /// Scheduling priority; higher is more important.
    pub priority: u32,
    /// Whether tasks of this job may be preempted.
    pub preemptible: bool,
    /// Minimum instances that must be running for the job to be healthy.
    pub min_running_instances: u32,
    /// Maximum instances allowed to run concurrently.
    pub max_running_instances: u32,
    /// Maximum wall-clock runtime per task, seconds. 0 = unlimited.
    pub max_runtime_secs: u64,
}

impl Default for Sla {
    fn default() -> Self {
        Self {
            priority: 0,
            preemptible: true,
            min_running_instances: 0,
            max_running_instances: u32::MAX,
            max_runtime_secs: 0,
        }
    }
}

/// Aggregate lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Initialized,
    Pending,
    Running,
    Succeeded,
    Failed,
    Killed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Killed)
    }
}

/// Specification for a job, as submitted by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: JobId,
    pub name: String,
    pub owning_team: String,
    pub labels: HashMap<String, String>,
    /// The leaf resource pool this job is admitted through.
    pub respool_id: PoolId,
    pub job_type: JobType,
    pub sla: Sla,
    /// Default config applied to every instance.
    pub default_task: TaskSpec,
    /// Per-instance overrides, keyed by instance index.
    #[serde(default)]
    pub instance_overrides: HashMap<u32, TaskSpec>,
    pub instance_count: u32,
}

impl JobSpec {
    /// Effective task spec for an instance (override or default).
    pub fn task_spec(&self, instance_idx: u32) -> &TaskSpec {
        self.instance_overrides
            .get(&instance_idx)
            .unwrap_or(&self.default_task)
    }

    /// Validate a submitted job config.
    ///
    /// Enforced at the API boundary before anything is persisted. The
    /// SLA bounds matter most: a floor above the instance count can
    /// never be met and would keep the goal-state driver re-enqueueing
    /// forever. `max_running_instances == u32::MAX` means unlimited.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("job name must not be empty".to_string());
        }
        if self.instance_count == 0 {
            return Err("instance count must be positive".to_string());
        }

        let sla = &self.sla;
        if sla.min_running_instances > sla.max_running_instances {
            return Err(format!(
                "min running instances {} exceeds max running instances {}",
                sla.min_running_instances, sla.max_running_instances
            ));
        }
        if sla.min_running_instances > self.instance_count {
            return Err(format!(
                "min running instances {} exceeds instance count {}",
                sla.min_running_instances, self.instance_count
            ));
        }
        if sla.max_running_instances != u32::MAX
            && sla.max_running_instances > self.instance_count
        {
            return Err(format!(
                "max running instances {} exceeds instance count {}",
                sla.max_running_instances, self.instance_count
            ));
        }

        self.default_task
            .validate()
            .map_err(|e| format!("default task config: {e}"))?;
        for (idx, task) in &self.instance_overrides {
            if *idx >= self.instance_count {
                return Err(format!(
                    "task config override for instance {idx} is outside instance count {}",
                    self.instance_count
                ));
            }
            task.validate()
                .map_err(|e| format!("task config for instance {idx}: {e}"))?;
        }
        Ok(())
    }

    /// Validate a config update against the currently stored config.
    ///
    /// Identity fields are immutable, the instance count can only grow,
    /// and the configs of existing instances cannot change.
    pub fn validate_update(&self, current: &JobSpec) -> Result<(), String> {
        self.validate()?;

        if self.name != current.name {
            return Err("job name is immutable".to_string());
        }
        if self.owning_team != current.owning_team {
            return Err("owning team is immutable".to_string());
        }
        if self.labels != current.labels {
            return Err("job labels are immutable".to_string());
        }
        if self.respool_id != current.respool_id {
            return Err("resource pool is immutable".to_string());
        }
        if self.job_type != current.job_type {
            return Err("job type is immutable".to_string());
        }
        if self.instance_count < current.instance_count {
            return Err(format!(
                "instance count cannot shrink from {} to {}",
                current.instance_count, self.instance_count
            ));
        }
        if self.default_task != current.default_task {
            return Err("default task config is immutable".to_string());
        }
        for idx in 0..current.instance_count {
            if self.instance_overrides.get(&idx) != current.instance_overrides.get(&idx) {
                return Err(format!("config of existing instance {idx} cannot change"));
            }
        }
        Ok(())
    }
}

/// Mutable runtime of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRuntime {
    pub state: JobState,
    pub goal_state: JobState,
    /// Unix seconds at creation.
    pub creation_time: u64,
    /// Unix seconds when the first task started running, if any.
    pub start_time: Option<u64>,
    /// Unix seconds when the job reached a terminal state, if it has.
    pub completion_time: Option<u64>,
    /// Count of tasks per state, refreshed by the goal-state driver.
    #[serde(default)]
    pub task_stats: HashMap<String, u32>,
}

impl JobRuntime {
    pub fn new(creation_time: u64) -> Self {
        Self {
            state: JobState::Initialized,
            goal_state: JobState::Succeeded,
            creation_time,
            start_time: None,
            completion_time: None,
            task_stats: HashMap::new(),
        }
    }
}

// ── Tasks ──────────────────────────────────────────────────────────

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Initialized,
    Pending,
    Ready,
    Placing,
    Placed,
    Launching,
    Launched,
    Starting,
    Running,
    Succeeded,
    Failed,
    Killing,
    Killed,
    Lost,
    Preempting,
    Reserved,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Killed | TaskState::Lost
        )
    }

    /// Short name used in metrics labels and task-stat maps.
    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Initialized => "initialized",
            TaskState::Pending => "pending",
            TaskState::Ready => "ready",
            TaskState::Placing => "placing",
            TaskState::Placed => "placed",
            TaskState::Launching => "launching",
            TaskState::Launched => "launched",
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Killing => "killing",
            TaskState::Killed => "killed",
            TaskState::Lost => "lost",
            TaskState::Preempting => "preempting",
            TaskState::Reserved => "reserved",
        }
    }

    /// All states, in declaration order.
    pub const ALL: [TaskState; 16] = [
        TaskState::Initialized,
        TaskState::Pending,
        TaskState::Ready,
        TaskState::Placing,
        TaskState::Placed,
        TaskState::Launching,
        TaskState::Launched,
        TaskState::Starting,
        TaskState::Running,
        TaskState::Succeeded,
        TaskState::Failed,
        TaskState::Killing,
        TaskState::Killed,
        TaskState::Lost,
        TaskState::Preempting,
        TaskState::Reserved,
    ];
}

/// Scheduling constraint evaluated against host attributes and labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Constraint {
    /// Host must carry this exact label.
    HostLabel { key: String, value: String },
    /// Host attribute must equal the given value.
    AttributeEquals { key: String, value: String },
    /// All sub-constraints must hold.
    And { constraints: Vec<Constraint> },
    /// At least one sub-constraint must hold.
    Or { constraints: Vec<Constraint> },
}

impl Constraint {
    /// Evaluate against a host's merged attribute/label map.
    pub fn matches(&self, attributes: &HashMap<String, String>) -> bool {
        match self {
            Constraint::HostLabel { key, value } | Constraint::AttributeEquals { key, value } => {
                attributes.get(key).is_some_and(|v| v == value)
            }
            Constraint::And { constraints } => constraints.iter().all(|c| c.matches(attributes)),
            Constraint::Or { constraints } => constraints.iter().any(|c| c.matches(attributes)),
        }
    }
}

/// Resource request of a single task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(flatten)]
    pub scalar: Resources,
    /// File-descriptor limit for the container.
    #[serde(default)]
    pub fd_limit: u32,
    /// Number of dynamically assigned ports the task needs.
    #[serde(default)]
    pub num_ports: u32,
}

/// Persistent-volume request attached to a stateful task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub container_path: String,
    pub size_mb: u64,
}

/// Specification for a task instance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub resources: ResourceRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<Constraint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeSpec>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl TaskSpec {
    /// Validate one instance's config.
    pub fn validate(&self) -> Result<(), String> {
        for kind in crate::resources::ResourceKind::ALL {
            let value = self.resources.scalar.get(kind);
            if !value.is_finite() || value < 0.0 {
                return Err(format!("resource {kind:?} must be a non-negative number"));
            }
        }
        if let Some(volume) = &self.volume {
            if volume.container_path.is_empty() {
                return Err("volume container path must not be empty".to_string());
            }
            if volume.size_mb == 0 {
                return Err("volume size must be positive".to_string());
            }
        }
        Ok(())
    }
}

/// Mutable runtime of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRuntime {
    pub state: TaskState,
    pub goal_state: TaskState,
    /// The id the external cluster manager knows this attempt by.
    pub cm_task_id: String,
    /// Host the task is bound to, once placed.
    #[serde(default)]
    pub host: Option<String>,
    /// CM agent id on the bound host.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Dynamically assigned ports.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Machine-readable reason for the last transition.
    #[serde(default)]
    pub reason: String,
    /// Human-readable message for the last transition.
    #[serde(default)]
    pub message: String,
    /// Number of failed launch/run attempts so far.
    #[serde(default)]
    pub fail_count: u32,
    /// CM task ids from earlier attempts, oldest first.
    #[serde(default)]
    pub prev_cm_task_ids: Vec<String>,
}

impl TaskRuntime {
    /// Fresh runtime for a newly created instance.
    pub fn new(task_id: &str) -> Self {
        Self {
            state: TaskState::Initialized,
            goal_state: TaskState::Succeeded,
            cm_task_id: new_cm_task_id(task_id),
            host: None,
            agent_id: None,
            ports: Vec::new(),
            reason: String::new(),
            message: String::new(),
            fail_count: 0,
            prev_cm_task_ids: Vec::new(),
        }
    }

    /// Archive the current CM id and mint a fresh one for a re-launch.
    pub fn regenerate_cm_task_id(&mut self, task_id: &str) {
        let old = std::mem::replace(&mut self.cm_task_id, new_cm_task_id(task_id));
        self.prev_cm_task_ids.push(old);
    }
}

/// A task as it travels through the scheduling pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDesc {
    pub id: TaskId,
    pub job_id: JobId,
    pub instance_idx: u32,
    pub task_type: TaskType,
    pub respool_id: PoolId,
    pub priority: u32,
    pub preemptible: bool,
    pub spec: TaskSpec,
    /// CM id of the current attempt; regenerated per launch.
    pub cm_task_id: String,
}

// ── Gangs & placements ─────────────────────────────────────────────

/// An ordered set of tasks that must be co-scheduled atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gang {
    pub tasks: Vec<TaskDesc>,
}

impl Gang {
    pub fn of(tasks: Vec<TaskDesc>) -> Self {
        Self { tasks }
    }

    /// Combined scalar demand of all member tasks.
    pub fn demand(&self) -> Resources {
        self.tasks
            .iter()
            .fold(Resources::ZERO, |acc, t| acc.add(&t.spec.resources.scalar))
    }

    /// Total dynamic ports required.
    pub fn ports_needed(&self) -> u32 {
        self.tasks.iter().map(|t| t.spec.resources.num_ports).sum()
    }

    /// Priority of the gang = priority of its first task.
    pub fn priority(&self) -> u32 {
        self.tasks.first().map(|t| t.priority).unwrap_or(0)
    }

    pub fn task_type(&self) -> TaskType {
        self.tasks
            .first()
            .map(|t| t.task_type)
            .unwrap_or(TaskType::Unknown)
    }
}

/// Binding of a gang to a host, prior to launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub gang: Gang,
    pub hostname: String,
    pub agent_id: String,
    /// Ports carved out of the host offer, in task order.
    pub ports: Vec<u16>,
    pub task_type: TaskType,
}

// ── Offers ─────────────────────────────────────────────────────────

/// A time-bounded capacity grant from the cluster manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostOffer {
    pub id: String,
    pub hostname: String,
    pub agent_id: String,
    pub resources: Resources,
    /// Port ranges offered, flattened to individual ports.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Host attributes advertised by the CM (rack, zone, ...).
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    /// Unix seconds after which the CM may rescind the offer.
    pub expiry: u64,
}

// ── Resource pools ─────────────────────────────────────────────────

/// Queue ordering policy inside a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    /// Higher priority first; FIFO within a priority bucket.
    PriorityFifo,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        SchedulingPolicy::PriorityFifo
    }
}

/// Specification of one node in the resource-pool tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub id: PoolId,
    /// None for the root pool.
    pub parent_id: Option<PoolId>,
    pub name: String,
    /// Guaranteed share, honored before weight-based distribution.
    pub reservation: Resources,
    /// Hard ceiling on the pool's allocation.
    pub limit: Resources,
    /// Relative weight for distributing unreserved capacity.
    pub share_weight: f64,
    #[serde(default)]
    pub policy: SchedulingPolicy,
    /// Whether this pool's unused entitlement may be lent to siblings.
    #[serde(default = "default_true")]
    pub preemptible: bool,
}

fn default_true() -> bool {
    true
}

// ── Job updates ────────────────────────────────────────────────────

/// State of a job-wide rolling update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Initialized,
    RollingForward,
    Succeeded,
    Aborted,
}

/// Progress record of a job-wide update rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub id: String,
    pub job_id: JobId,
    pub state: UpdateState,
    pub instances_total: u32,
    pub instances_done: u32,
}

// ── Volumes ────────────────────────────────────────────────────────

/// Lifecycle state of a persistent volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeState {
    Initialized,
    Created,
    Deleted,
}

/// A persistent volume bound to a stateful task instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentVolume {
    pub id: String,
    pub job_id: JobId,
    pub instance_idx: u32,
    pub container_path: String,
    pub size_mb: u64,
    pub state: VolumeState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_round_trip() {
        let job = uuid::Uuid::new_v4().to_string();
        let id = task_id(&job, 7);
        let (parsed_job, idx) = parse_task_id(&id).unwrap();
        assert_eq!(parsed_job, job);
        assert_eq!(idx, 7);
    }

    #[test]
    fn parse_task_id_rejects_garbage() {
        assert!(parse_task_id("nodashhere").is_none());
        assert!(parse_task_id("job-notanumber").is_none());
    }

    #[test]
    fn cm_task_id_recovers_task_id() {
        let id = task_id("0afdc7b5-8f6f-4e9f-9d2a-000000000001", 3);
        let cm_id = new_cm_task_id(&id);
        assert_eq!(cm_task_id_to_task_id(&cm_id), Some(id));
        assert_eq!(cm_task_id_to_task_id("short"), None);
    }

    #[test]
    fn cm_task_id_is_fresh_per_attempt() {
        let mut rt = TaskRuntime::new("job-0");
        let first = rt.cm_task_id.clone();

        rt.regenerate_cm_task_id("job-0");
        assert_ne!(rt.cm_task_id, first);
        assert_eq!(rt.prev_cm_task_ids, vec![first]);
    }

    #[test]
    fn gang_demand_sums_members() {
        let mut t1 = TaskDesc {
            id: "j-0".into(),
            job_id: "j".into(),
            instance_idx: 0,
            task_type: TaskType::Batch,
            respool_id: "leaf".into(),
            priority: 3,
            preemptible: true,
            spec: TaskSpec::default(),
            cm_task_id: new_cm_task_id("j-0"),
        };
        t1.spec.resources.scalar = Resources::new(1.0, 100.0, 0.0, 0.0);
        let mut t2 = t1.clone();
        t2.id = "j-1".into();
        t2.instance_idx = 1;
        t2.spec.resources.scalar = Resources::new(2.0, 200.0, 0.0, 0.0);

        let gang = Gang::of(vec![t1, t2]);
        assert_eq!(gang.demand(), Resources::new(3.0, 300.0, 0.0, 0.0));
        assert_eq!(gang.priority(), 3);
        assert_eq!(gang.task_type(), TaskType::Batch);
    }

    #[test]
    fn constraint_evaluation() {
        let mut attrs = HashMap::new();
        attrs.insert("zone".to_string(), "a".to_string());
        attrs.insert("rack".to_string(), "r12".to_string());

        let c = Constraint::And {
            constraints: vec![
                Constraint::HostLabel {
                    key: "zone".into(),
                    value: "a".into(),
                },
                Constraint::Or {
                    constraints: vec![
                        Constraint::AttributeEquals {
                            key: "rack".into(),
                            value: "r12".into(),
                        },
                        Constraint::AttributeEquals {
                            key: "rack".into(),
                            value: "r13".into(),
                        },
                    ],
                },
            ],
        };
        assert!(c.matches(&attrs));

        attrs.insert("zone".to_string(), "b".to_string());
        assert!(!c.matches(&attrs));
    }

    fn make_job_spec(instances: u32) -> JobSpec {
        JobSpec {
            id: "j".to_string(),
            name: "example".to_string(),
            owning_team: "infra".to_string(),
            labels: HashMap::new(),
            respool_id: "leaf".to_string(),
            job_type: JobType::Batch,
            sla: Sla::default(),
            default_task: TaskSpec::default(),
            instance_overrides: HashMap::new(),
            instance_count: instances,
        }
    }

    #[test]
    fn job_spec_validation_accepts_defaults() {
        assert!(make_job_spec(3).validate().is_ok());
    }

    #[test]
    fn job_spec_validation_rejects_bad_sla_bounds() {
        let mut spec = make_job_spec(3);
        spec.sla.min_running_instances = 2;
        spec.sla.max_running_instances = 1;
        assert!(spec.validate().is_err());

        let mut spec = make_job_spec(3);
        spec.sla.min_running_instances = 4;
        assert!(spec.validate().is_err());

        let mut spec = make_job_spec(3);
        spec.sla.min_running_instances = 2;
        spec.sla.max_running_instances = 5;
        assert!(spec.validate().is_err());

        // u32::MAX means unlimited and is always accepted.
        let mut spec = make_job_spec(3);
        spec.sla.min_running_instances = 3;
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn job_spec_validation_checks_instance_configs() {
        let mut spec = make_job_spec(2);
        spec.instance_overrides.insert(5, TaskSpec::default());
        assert!(spec.validate().is_err());

        let mut spec = make_job_spec(2);
        spec.default_task.resources.scalar.cpu = -1.0;
        assert!(spec.validate().is_err());

        let mut spec = make_job_spec(2);
        spec.default_task.volume = Some(VolumeSpec {
            container_path: String::new(),
            size_mb: 128,
        });
        assert!(spec.validate().is_err());
    }

    #[test]
    fn job_update_keeps_identity_fields_immutable() {
        let current = make_job_spec(2);

        let mut updated = current.clone();
        updated.respool_id = "other".to_string();
        assert!(updated.validate_update(&current).is_err());

        let mut updated = current.clone();
        updated.job_type = JobType::Service;
        assert!(updated.validate_update(&current).is_err());

        let mut updated = current.clone();
        updated.owning_team = "someone-else".to_string();
        assert!(updated.validate_update(&current).is_err());
    }

    #[test]
    fn job_update_instance_count_only_grows() {
        let current = make_job_spec(3);

        let mut updated = current.clone();
        updated.instance_count = 2;
        assert!(updated.validate_update(&current).is_err());

        let mut updated = current.clone();
        updated.instance_count = 5;
        assert!(updated.validate_update(&current).is_ok());
    }

    #[test]
    fn job_update_cannot_touch_existing_instance_configs() {
        let mut current = make_job_spec(2);
        current
            .instance_overrides
            .insert(0, TaskSpec::default());

        // Changing an existing override is rejected.
        let mut updated = current.clone();
        let mut changed = TaskSpec::default();
        changed.resources.scalar.cpu = 2.0;
        updated.instance_overrides.insert(0, changed);
        assert!(updated.validate_update(&current).is_err());

        // Dropping an existing override is rejected too.
        let mut updated = current.clone();
        updated.instance_overrides.remove(&0);
        assert!(updated.validate_update(&current).is_err());

        // Overrides for newly added instances are fine.
        let mut updated = current.clone();
        updated.instance_count = 4;
        updated.instance_overrides.insert(3, TaskSpec::default());
        assert!(updated.validate_update(&current).is_ok());
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Lost.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Pending.is_terminal());
    }
}
