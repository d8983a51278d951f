//! Embedded redb-backed store.
//!
//! Implements every store capability over a single redb database with
//! JSON-serialized values. Supports both on-disk and in-memory backends;
//! the latter backs unit and scenario tests. Remote backends implement the
//! same traits against their own transports.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use regatta_core::{
    parse_task_id, task_id, JobId, JobRuntime, JobSpec, JobState, JobUpdate, PersistentVolume,
    PoolId, PoolSpec, TaskId, TaskRuntime, TaskState,
};

use crate::error::{StoreError, StoreResult};
use crate::tables::*;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Thread-safe embedded store.
#[derive(Clone)]
pub struct EmbeddedStore {
    db: Arc<Database>,
}

impl EmbeddedStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(ConnUnavailable))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "embedded store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(ConnUnavailable))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(WriteFailure))?;
        txn.open_table(JOBS).map_err(map_err!(WriteFailure))?;
        txn.open_table(JOB_RUNTIMES).map_err(map_err!(WriteFailure))?;
        txn.open_table(TASKS).map_err(map_err!(WriteFailure))?;
        txn.open_table(POOLS).map_err(map_err!(WriteFailure))?;
        txn.open_table(FRAMEWORK).map_err(map_err!(WriteFailure))?;
        txn.open_table(VOLUMES).map_err(map_err!(WriteFailure))?;
        txn.open_table(UPDATES).map_err(map_err!(WriteFailure))?;
        txn.commit().map_err(map_err!(WriteFailure))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: serde::Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(WriteFailure))?;
        let txn = self.db.begin_write().map_err(map_err!(WriteFailure))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(WriteFailure))?;
            t.insert(key, bytes.as_slice())
                .map_err(map_err!(WriteFailure))?;
        }
        txn.commit().map_err(map_err!(WriteFailure))?;
        Ok(())
    }

    fn get<T: serde::de::DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StoreResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(ReadFailure))?;
        let t = txn.open_table(table).map_err(map_err!(ReadFailure))?;
        match t.get(key).map_err(map_err!(ReadFailure))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(ReadFailure))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list<T: serde::de::DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key_prefix: &str,
    ) -> StoreResult<Vec<(String, T)>> {
        let txn = self.db.begin_read().map_err(map_err!(ReadFailure))?;
        let t = txn.open_table(table).map_err(map_err!(ReadFailure))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(ReadFailure))? {
            let (key, value) = entry.map_err(map_err!(ReadFailure))?;
            if !key.value().starts_with(key_prefix) {
                continue;
            }
            let parsed = serde_json::from_slice(value.value()).map_err(map_err!(ReadFailure))?;
            results.push((key.value().to_string(), parsed));
        }
        Ok(results)
    }

    fn remove(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(WriteFailure))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(WriteFailure))?;
            existed = t.remove(key).map_err(map_err!(WriteFailure))?.is_some();
        }
        txn.commit().map_err(map_err!(WriteFailure))?;
        Ok(existed)
    }

    fn task_key(id: &TaskId) -> StoreResult<String> {
        let (job_id, idx) = parse_task_id(id)
            .ok_or_else(|| StoreError::NotFound(format!("malformed task id {id}")))?;
        Ok(format!("{job_id}:{idx}"))
    }
}

// ── JobStore ───────────────────────────────────────────────────────

#[async_trait]
impl crate::traits::JobStore for EmbeddedStore {
    async fn create_job(&self, spec: &JobSpec, runtime: &JobRuntime) -> StoreResult<()> {
        if self.get::<JobSpec>(JOBS, &spec.id)?.is_some() {
            return Err(StoreError::AlreadyExists(format!("job {}", spec.id)));
        }
        self.put(JOBS, &spec.id, spec)?;
        self.put(JOB_RUNTIMES, &spec.id, runtime)?;
        debug!(job_id = %spec.id, "job created");
        Ok(())
    }

    async fn get_job_config(&self, id: &JobId) -> StoreResult<JobSpec> {
        self.get(JOBS, id)?
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))
    }

    async fn update_job_config(&self, spec: &JobSpec) -> StoreResult<()> {
        if self.get::<JobSpec>(JOBS, &spec.id)?.is_none() {
            return Err(StoreError::NotFound(format!("job {}", spec.id)));
        }
        self.put(JOBS, &spec.id, spec)
    }

    async fn get_job_runtime(&self, id: &JobId) -> StoreResult<JobRuntime> {
        self.get(JOB_RUNTIMES, id)?
            .ok_or_else(|| StoreError::NotFound(format!("job runtime {id}")))
    }

    async fn update_job_runtime(&self, id: &JobId, runtime: &JobRuntime) -> StoreResult<()> {
        self.put(JOB_RUNTIMES, id, runtime)
    }

    async fn get_jobs_by_states(&self, states: &[JobState]) -> StoreResult<Vec<JobSpec>> {
        let mut jobs = Vec::new();
        for (id, runtime) in self.list::<JobRuntime>(JOB_RUNTIMES, "")? {
            if states.contains(&runtime.state) {
                if let Some(spec) = self.get::<JobSpec>(JOBS, &id)? {
                    jobs.push(spec);
                }
            }
        }
        Ok(jobs)
    }

    async fn query_jobs(&self, respool_id: Option<&PoolId>) -> StoreResult<Vec<JobSpec>> {
        let jobs = self
            .list::<JobSpec>(JOBS, "")?
            .into_iter()
            .map(|(_, spec)| spec)
            .filter(|spec| respool_id.is_none_or(|p| &spec.respool_id == p))
            .collect();
        Ok(jobs)
    }

    async fn delete_job(&self, id: &JobId) -> StoreResult<()> {
        if !self.remove(JOBS, id)? {
            return Err(StoreError::NotFound(format!("job {id}")));
        }
        self.remove(JOB_RUNTIMES, id)?;
        debug!(job_id = %id, "job deleted");
        Ok(())
    }
}

// ── TaskStore ──────────────────────────────────────────────────────

#[async_trait]
impl crate::traits::TaskStore for EmbeddedStore {
    async fn create_task_runtimes(
        &self,
        job_id: &JobId,
        runtimes: &HashMap<u32, TaskRuntime>,
    ) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(WriteFailure))?;
        {
            let mut t = txn.open_table(TASKS).map_err(map_err!(WriteFailure))?;
            for (idx, runtime) in runtimes {
                let key = format!("{job_id}:{idx}");
                let bytes = serde_json::to_vec(runtime).map_err(map_err!(WriteFailure))?;
                t.insert(key.as_str(), bytes.as_slice())
                    .map_err(map_err!(WriteFailure))?;
            }
        }
        txn.commit().map_err(map_err!(WriteFailure))?;
        debug!(%job_id, count = runtimes.len(), "task runtimes created");
        Ok(())
    }

    async fn get_task_by_id(&self, id: &TaskId) -> StoreResult<TaskRuntime> {
        let key = Self::task_key(id)?;
        self.get(TASKS, &key)?
            .ok_or_else(|| StoreError::NotFound(format!("task {id}")))
    }

    async fn update_task_runtime(&self, id: &TaskId, runtime: &TaskRuntime) -> StoreResult<()> {
        let key = Self::task_key(id)?;
        self.put(TASKS, &key, runtime)
    }

    async fn update_task_runtime_if_cm_id(
        &self,
        id: &TaskId,
        runtime: &TaskRuntime,
        expected_cm_task_id: &str,
    ) -> StoreResult<()> {
        let key = Self::task_key(id)?;
        let txn = self.db.begin_write().map_err(map_err!(WriteFailure))?;
        {
            let mut t = txn.open_table(TASKS).map_err(map_err!(WriteFailure))?;
            let current: TaskRuntime = match t.get(key.as_str()).map_err(map_err!(ReadFailure))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(ReadFailure))?
                }
                None => return Err(StoreError::NotFound(format!("task {id}"))),
            };
            if current.cm_task_id != expected_cm_task_id {
                return Err(StoreError::CasNotApplied(format!(
                    "task {id}: cm id is {}, expected {expected_cm_task_id}",
                    current.cm_task_id
                )));
            }
            let bytes = serde_json::to_vec(runtime).map_err(map_err!(WriteFailure))?;
            t.insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(WriteFailure))?;
        }
        txn.commit().map_err(map_err!(WriteFailure))?;
        Ok(())
    }

    async fn get_tasks_for_job(&self, job_id: &JobId) -> StoreResult<HashMap<u32, TaskRuntime>> {
        let prefix = format!("{job_id}:");
        let mut tasks = HashMap::new();
        for (key, runtime) in self.list::<TaskRuntime>(TASKS, &prefix)? {
            if let Some(idx) = key.strip_prefix(&prefix).and_then(|s| s.parse().ok()) {
                tasks.insert(idx, runtime);
            }
        }
        Ok(tasks)
    }

    async fn get_tasks_by_state(
        &self,
        job_id: &JobId,
        state: TaskState,
    ) -> StoreResult<Vec<TaskId>> {
        let tasks = self.get_tasks_for_job(job_id).await?;
        let mut ids: Vec<(u32, TaskId)> = tasks
            .into_iter()
            .filter(|(_, rt)| rt.state == state)
            .map(|(idx, _)| (idx, task_id(job_id, idx)))
            .collect();
        ids.sort_by_key(|(idx, _)| *idx);
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    async fn delete_tasks_for_job(&self, job_id: &JobId) -> StoreResult<()> {
        let prefix = format!("{job_id}:");
        let keys: Vec<String> = self
            .list::<TaskRuntime>(TASKS, &prefix)?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        let txn = self.db.begin_write().map_err(map_err!(WriteFailure))?;
        {
            let mut t = txn.open_table(TASKS).map_err(map_err!(WriteFailure))?;
            for key in &keys {
                t.remove(key.as_str()).map_err(map_err!(WriteFailure))?;
            }
        }
        txn.commit().map_err(map_err!(WriteFailure))?;
        Ok(())
    }
}

// ── ResourcePoolStore ──────────────────────────────────────────────

#[async_trait]
impl crate::traits::ResourcePoolStore for EmbeddedStore {
    async fn create_resource_pool(&self, spec: &PoolSpec) -> StoreResult<()> {
        if self.get::<PoolSpec>(POOLS, &spec.id)?.is_some() {
            return Err(StoreError::AlreadyExists(format!("pool {}", spec.id)));
        }
        self.put(POOLS, &spec.id, spec)
    }

    async fn get_resource_pool(&self, id: &PoolId) -> StoreResult<PoolSpec> {
        self.get(POOLS, id)?
            .ok_or_else(|| StoreError::NotFound(format!("pool {id}")))
    }

    async fn list_resource_pools(&self) -> StoreResult<Vec<PoolSpec>> {
        Ok(self
            .list::<PoolSpec>(POOLS, "")?
            .into_iter()
            .map(|(_, spec)| spec)
            .collect())
    }

    async fn update_resource_pool(&self, spec: &PoolSpec) -> StoreResult<()> {
        if self.get::<PoolSpec>(POOLS, &spec.id)?.is_none() {
            return Err(StoreError::NotFound(format!("pool {}", spec.id)));
        }
        self.put(POOLS, &spec.id, spec)
    }

    async fn delete_resource_pool(&self, id: &PoolId) -> StoreResult<()> {
        if !self.remove(POOLS, id)? {
            return Err(StoreError::NotFound(format!("pool {id}")));
        }
        Ok(())
    }
}

// ── FrameworkInfoStore ─────────────────────────────────────────────

#[async_trait]
impl crate::traits::FrameworkInfoStore for EmbeddedStore {
    async fn get_framework_id(&self) -> StoreResult<Option<String>> {
        self.get(FRAMEWORK, "framework_id")
    }

    async fn set_framework_id(&self, id: &str) -> StoreResult<()> {
        self.put(FRAMEWORK, "framework_id", &id.to_string())
    }

    async fn get_stream_id(&self) -> StoreResult<Option<String>> {
        self.get(FRAMEWORK, "stream_id")
    }

    async fn set_stream_id(&self, id: &str) -> StoreResult<()> {
        self.put(FRAMEWORK, "stream_id", &id.to_string())
    }
}

// ── VolumeStore ────────────────────────────────────────────────────

#[async_trait]
impl crate::traits::VolumeStore for EmbeddedStore {
    async fn create_persistent_volume(&self, volume: &PersistentVolume) -> StoreResult<()> {
        if self.get::<PersistentVolume>(VOLUMES, &volume.id)?.is_some() {
            return Err(StoreError::AlreadyExists(format!("volume {}", volume.id)));
        }
        self.put(VOLUMES, &volume.id, volume)
    }

    async fn get_persistent_volume(&self, id: &str) -> StoreResult<PersistentVolume> {
        self.get(VOLUMES, id)?
            .ok_or_else(|| StoreError::NotFound(format!("volume {id}")))
    }

    async fn update_persistent_volume(&self, volume: &PersistentVolume) -> StoreResult<()> {
        self.put(VOLUMES, &volume.id, volume)
    }

    async fn delete_persistent_volume(&self, id: &str) -> StoreResult<()> {
        if !self.remove(VOLUMES, id)? {
            return Err(StoreError::NotFound(format!("volume {id}")));
        }
        Ok(())
    }

    async fn list_persistent_volumes(&self) -> StoreResult<Vec<PersistentVolume>> {
        Ok(self
            .list::<PersistentVolume>(VOLUMES, "")?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }
}

// ── UpdateStore ────────────────────────────────────────────────────

#[async_trait]
impl crate::traits::UpdateStore for EmbeddedStore {
    async fn create_update(&self, update: &JobUpdate) -> StoreResult<()> {
        if self.get::<JobUpdate>(UPDATES, &update.id)?.is_some() {
            return Err(StoreError::AlreadyExists(format!("update {}", update.id)));
        }
        self.put(UPDATES, &update.id, update)
    }

    async fn get_update_progress(&self, id: &str) -> StoreResult<JobUpdate> {
        self.get(UPDATES, id)?
            .ok_or_else(|| StoreError::NotFound(format!("update {id}")))
    }

    async fn set_update_progress(&self, update: &JobUpdate) -> StoreResult<()> {
        self.put(UPDATES, &update.id, update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::*;
    use regatta_core::{Resources, TaskSpec};

    fn test_store() -> EmbeddedStore {
        EmbeddedStore::open_in_memory().unwrap()
    }

    fn make_job(id: &str) -> (JobSpec, JobRuntime) {
        let spec = JobSpec {
            id: id.to_string(),
            name: format!("job-{id}"),
            owning_team: "infra".to_string(),
            labels: HashMap::new(),
            respool_id: "leaf-a".to_string(),
            job_type: regatta_core::JobType::Batch,
            sla: regatta_core::Sla::default(),
            default_task: TaskSpec::default(),
            instance_overrides: HashMap::new(),
            instance_count: 2,
        };
        (spec, JobRuntime::new(1000))
    }

    #[tokio::test]
    async fn create_and_get_job() {
        let store = test_store();
        let (spec, runtime) = make_job("j1");

        store.create_job(&spec, &runtime).await.unwrap();
        assert_eq!(store.get_job_config(&spec.id).await.unwrap(), spec);
        assert_eq!(store.get_job_runtime(&spec.id).await.unwrap(), runtime);
    }

    #[tokio::test]
    async fn duplicate_job_is_rejected() {
        let store = test_store();
        let (spec, runtime) = make_job("j1");

        store.create_job(&spec, &runtime).await.unwrap();
        let err = store.create_job(&spec, &runtime).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let store = test_store();
        let err = store.get_job_config(&"nope".to_string()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn jobs_by_state_filters_on_runtime() {
        let store = test_store();
        let (spec1, mut rt1) = make_job("j1");
        rt1.state = JobState::Running;
        let (spec2, rt2) = make_job("j2");

        store.create_job(&spec1, &rt1).await.unwrap();
        store.create_job(&spec2, &rt2).await.unwrap();

        let running = store.get_jobs_by_states(&[JobState::Running]).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "j1");
    }

    #[tokio::test]
    async fn task_runtimes_round_trip() {
        let store = test_store();
        let job_id = "job-a".to_string();

        let mut runtimes = HashMap::new();
        runtimes.insert(0, TaskRuntime::new("job-a-0"));
        runtimes.insert(1, TaskRuntime::new("job-a-1"));
        store.create_task_runtimes(&job_id, &runtimes).await.unwrap();

        let loaded = store.get_tasks_for_job(&job_id).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[&0], runtimes[&0]);

        let task = store.get_task_by_id(&"job-a-1".to_string()).await.unwrap();
        assert_eq!(task, runtimes[&1]);
    }

    #[tokio::test]
    async fn conditional_update_checks_cm_id() {
        let store = test_store();
        let job_id = "job-a".to_string();
        let mut runtimes = HashMap::new();
        let rt = TaskRuntime::new("job-a-0");
        let cm_id = rt.cm_task_id.clone();
        runtimes.insert(0, rt.clone());
        store.create_task_runtimes(&job_id, &runtimes).await.unwrap();

        // Matching CM id applies.
        let mut updated = rt.clone();
        updated.state = regatta_core::TaskState::Launched;
        store
            .update_task_runtime_if_cm_id(&"job-a-0".to_string(), &updated, &cm_id)
            .await
            .unwrap();

        // Stale CM id is refused.
        let err = store
            .update_task_runtime_if_cm_id(&"job-a-0".to_string(), &updated, "stale")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CasNotApplied(_)));
    }

    #[tokio::test]
    async fn tasks_by_state_returns_ordered_ids() {
        let store = test_store();
        let job_id = "job-a".to_string();
        let mut runtimes = HashMap::new();
        for idx in 0..3 {
            let mut rt = TaskRuntime::new(&task_id(&job_id, idx));
            if idx != 1 {
                rt.state = TaskState::Pending;
            }
            runtimes.insert(idx, rt);
        }
        store.create_task_runtimes(&job_id, &runtimes).await.unwrap();

        let pending = store
            .get_tasks_by_state(&job_id, TaskState::Pending)
            .await
            .unwrap();
        assert_eq!(pending, vec!["job-a-0".to_string(), "job-a-2".to_string()]);
    }

    #[tokio::test]
    async fn pool_crud() {
        let store = test_store();
        let spec = PoolSpec {
            id: "leaf-a".to_string(),
            parent_id: Some("root".to_string()),
            name: "leaf-a".to_string(),
            reservation: Resources::new(10.0, 1024.0, 0.0, 0.0),
            limit: Resources::new(20.0, 2048.0, 0.0, 0.0),
            share_weight: 1.0,
            policy: Default::default(),
            preemptible: true,
        };

        store.create_resource_pool(&spec).await.unwrap();
        assert_eq!(store.get_resource_pool(&spec.id).await.unwrap(), spec);
        assert_eq!(store.list_resource_pools().await.unwrap().len(), 1);

        store.delete_resource_pool(&spec.id).await.unwrap();
        assert!(store.get_resource_pool(&spec.id).await.is_err());
    }

    #[tokio::test]
    async fn framework_info_round_trip() {
        let store = test_store();
        assert_eq!(store.get_framework_id().await.unwrap(), None);

        store.set_framework_id("fw-123").await.unwrap();
        store.set_stream_id("stream-9").await.unwrap();

        assert_eq!(
            store.get_framework_id().await.unwrap(),
            Some("fw-123".to_string())
        );
        assert_eq!(
            store.get_stream_id().await.unwrap(),
            Some("stream-9".to_string())
        );
    }

    #[tokio::test]
    async fn volume_lifecycle() {
        let store = test_store();
        let mut volume = PersistentVolume {
            id: "vol-1".to_string(),
            job_id: "j1".to_string(),
            instance_idx: 0,
            container_path: "/data".to_string(),
            size_mb: 512,
            state: regatta_core::VolumeState::Initialized,
        };

        store.create_persistent_volume(&volume).await.unwrap();
        volume.state = regatta_core::VolumeState::Created;
        store.update_persistent_volume(&volume).await.unwrap();

        let loaded = store.get_persistent_volume("vol-1").await.unwrap();
        assert_eq!(loaded.state, regatta_core::VolumeState::Created);

        store.delete_persistent_volume("vol-1").await.unwrap();
        assert!(store.get_persistent_volume("vol-1").await.is_err());
    }

    #[tokio::test]
    async fn delete_job_removes_tasks_separately() {
        let store = test_store();
        let (spec, runtime) = make_job("j1");
        store.create_job(&spec, &runtime).await.unwrap();

        let mut runtimes = HashMap::new();
        runtimes.insert(0, TaskRuntime::new("j1-0"));
        store.create_task_runtimes(&spec.id, &runtimes).await.unwrap();

        store.delete_job(&spec.id).await.unwrap();
        store.delete_tasks_for_job(&spec.id).await.unwrap();

        assert!(store.get_job_config(&spec.id).await.is_err());
        assert!(store.get_tasks_for_job(&spec.id).await.unwrap().is_empty());
    }
}
