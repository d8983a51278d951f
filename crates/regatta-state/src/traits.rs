//! Store capability traits.
//!
//! The control plane persists through one `Store` collaborator composed of
//! independent capabilities. Backends implement the composition; components
//! depend only on the capabilities they use. The surface is async because
//! production backends are remote; every call is expected to carry its own
//! deadline in the backend.

use std::collections::HashMap;

use async_trait::async_trait;

use regatta_core::{
    JobId, JobRuntime, JobSpec, JobState, JobUpdate, PersistentVolume, PoolId, PoolSpec, TaskId,
    TaskRuntime, TaskState,
};

use crate::error::StoreResult;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, spec: &JobSpec, runtime: &JobRuntime) -> StoreResult<()>;
    async fn get_job_config(&self, id: &JobId) -> StoreResult<JobSpec>;
    async fn update_job_config(&self, spec: &JobSpec) -> StoreResult<()>;
    async fn get_job_runtime(&self, id: &JobId) -> StoreResult<JobRuntime>;
    async fn update_job_runtime(&self, id: &JobId, runtime: &JobRuntime) -> StoreResult<()>;
    /// All jobs whose runtime state is one of `states`.
    async fn get_jobs_by_states(&self, states: &[JobState]) -> StoreResult<Vec<JobSpec>>;
    /// Jobs filtered by owning resource pool (None = all).
    async fn query_jobs(&self, respool_id: Option<&PoolId>) -> StoreResult<Vec<JobSpec>>;
    async fn delete_job(&self, id: &JobId) -> StoreResult<()>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create the initial runtimes for a batch of instances of one job.
    async fn create_task_runtimes(
        &self,
        job_id: &JobId,
        runtimes: &HashMap<u32, TaskRuntime>,
    ) -> StoreResult<()>;
    async fn get_task_by_id(&self, id: &TaskId) -> StoreResult<TaskRuntime>;
    /// Plain write of a task runtime.
    async fn update_task_runtime(&self, id: &TaskId, runtime: &TaskRuntime) -> StoreResult<()>;
    /// Conditional write: applied only while the stored runtime still carries
    /// `expected_cm_task_id`; otherwise `CasNotApplied`.
    async fn update_task_runtime_if_cm_id(
        &self,
        id: &TaskId,
        runtime: &TaskRuntime,
        expected_cm_task_id: &str,
    ) -> StoreResult<()>;
    async fn get_tasks_for_job(&self, job_id: &JobId) -> StoreResult<HashMap<u32, TaskRuntime>>;
    async fn get_tasks_by_state(
        &self,
        job_id: &JobId,
        state: TaskState,
    ) -> StoreResult<Vec<TaskId>>;
    async fn delete_tasks_for_job(&self, job_id: &JobId) -> StoreResult<()>;
}

#[async_trait]
pub trait ResourcePoolStore: Send + Sync {
    async fn create_resource_pool(&self, spec: &PoolSpec) -> StoreResult<()>;
    async fn get_resource_pool(&self, id: &PoolId) -> StoreResult<PoolSpec>;
    async fn list_resource_pools(&self) -> StoreResult<Vec<PoolSpec>>;
    async fn update_resource_pool(&self, spec: &PoolSpec) -> StoreResult<()>;
    async fn delete_resource_pool(&self, id: &PoolId) -> StoreResult<()>;
}

/// Identity the CM assigned to this framework, persisted across restarts.
#[async_trait]
pub trait FrameworkInfoStore: Send + Sync {
    async fn get_framework_id(&self) -> StoreResult<Option<String>>;
    async fn set_framework_id(&self, id: &str) -> StoreResult<()>;
    async fn get_stream_id(&self) -> StoreResult<Option<String>>;
    async fn set_stream_id(&self, id: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait VolumeStore: Send + Sync {
    async fn create_persistent_volume(&self, volume: &PersistentVolume) -> StoreResult<()>;
    async fn get_persistent_volume(&self, id: &str) -> StoreResult<PersistentVolume>;
    async fn update_persistent_volume(&self, volume: &PersistentVolume) -> StoreResult<()>;
    async fn delete_persistent_volume(&self, id: &str) -> StoreResult<()>;
    async fn list_persistent_volumes(&self) -> StoreResult<Vec<PersistentVolume>>;
}

#[async_trait]
pub trait UpdateStore: Send + Sync {
    async fn create_update(&self, update: &JobUpdate) -> StoreResult<()>;
    async fn get_update_progress(&self, id: &str) -> StoreResult<JobUpdate>;
    async fn set_update_progress(&self, update: &JobUpdate) -> StoreResult<()>;
}

/// The full capability set a backend provides.
pub trait Store:
    JobStore + TaskStore + ResourcePoolStore + FrameworkInfoStore + VolumeStore + UpdateStore
{
}

impl<T> Store for T where
    T: JobStore + TaskStore + ResourcePoolStore + FrameworkInfoStore + VolumeStore + UpdateStore
{
}
