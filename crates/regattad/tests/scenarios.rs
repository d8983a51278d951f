//! End-to-end scheduling scenarios.
//!
//! Wires the real pipeline (store, pool tree, tracker, offer pool,
//! admission scheduler, placement engine, launcher, goal-state driver)
//! around a scripted cluster-manager client and drives whole flows:
//! submit -> admit -> place -> launch -> status -> converge.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use regatta_cluster::{ClusterManagerClient, LaunchableTask, OfferOperation};
use regatta_core::config::PlacementStrategyKind;
use regatta_core::metrics::SchedulerMetrics;
use regatta_core::{
    task_id, CmRejectKind, Error, HostOffer, JobRuntime, JobSpec, JobState, JobType, PoolSpec,
    Resources, Result, Sla, TaskRuntime, TaskSpec, TaskState, TaskType, VolumeSpec,
};
use regatta_goalstate::{DriverConfig, GoalStateDriver};
use regatta_launcher::Launcher;
use regatta_offerpool::{HostState, OfferPool};
use regatta_placement::{strategy_for, EngineConfig, PlacementEngine};
use regatta_respool::{PoolTree, Scheduler};
use regatta_state::{EmbeddedStore, JobStore, TaskStore};
use regatta_task::{BackoffPolicy, DwellTimeouts, Tracker};

/// Scripted CM: records calls, optionally rejects launches.
#[derive(Default)]
struct ScriptedCm {
    launches: Mutex<Vec<(String, Vec<LaunchableTask>)>>,
    operations: Mutex<Vec<Vec<OfferOperation>>>,
    kills: Mutex<Vec<String>>,
    reject: Mutex<Option<CmRejectKind>>,
}

#[async_trait]
impl ClusterManagerClient for ScriptedCm {
    async fn launch_tasks(
        &self,
        hostname: &str,
        _agent_id: &str,
        tasks: Vec<LaunchableTask>,
    ) -> Result<()> {
        if let Some(kind) = *self.reject.lock().unwrap() {
            return Err(Error::cm_reject(kind, "scripted rejection"));
        }
        self.launches
            .lock()
            .unwrap()
            .push((hostname.to_string(), tasks));
        Ok(())
    }

    async fn offer_operations(
        &self,
        _hostname: &str,
        _agent_id: &str,
        operations: Vec<OfferOperation>,
    ) -> Result<()> {
        if let Some(kind) = *self.reject.lock().unwrap() {
            return Err(Error::cm_reject(kind, "scripted rejection"));
        }
        self.operations.lock().unwrap().push(operations);
        Ok(())
    }

    async fn kill_task(&self, cm_task_id: &str) -> Result<()> {
        self.kills.lock().unwrap().push(cm_task_id.to_string());
        Ok(())
    }

    async fn decline_offers(&self, _offer_ids: Vec<String>) -> Result<()> {
        Ok(())
    }
    async fn reconcile(&self, _cm_task_ids: Vec<String>) -> Result<()> {
        Ok(())
    }
    async fn acknowledge(&self, _cm_task_id: &str, _offset: u64) -> Result<()> {
        Ok(())
    }
}

struct Pipeline {
    store: EmbeddedStore,
    metrics: Arc<SchedulerMetrics>,
    tree: Arc<PoolTree>,
    tracker: Arc<Tracker>,
    offers: Arc<OfferPool>,
    scheduler: Arc<Scheduler>,
    engine: Arc<PlacementEngine>,
    driver: Arc<GoalStateDriver>,
    cm: Arc<ScriptedCm>,
}

fn pool(id: &str, parent: Option<&str>, cpu: f64) -> PoolSpec {
    PoolSpec {
        id: id.to_string(),
        parent_id: parent.map(String::from),
        name: id.to_string(),
        reservation: Resources::new(cpu, cpu * 1_000.0, 0.0, 0.0),
        limit: Resources::new(cpu * 2.0, cpu * 2_000.0, 0.0, 0.0),
        share_weight: 1.0,
        policy: Default::default(),
        preemptible: true,
    }
}

fn build_pipeline() -> Pipeline {
    let metrics = SchedulerMetrics::new();
    let tree = PoolTree::new(pool("root", None, 100.0));
    tree.create_pool(pool("leaf", Some("root"), 100.0)).unwrap();

    let tracker = Tracker::new(
        tree.clone(),
        metrics.clone(),
        BackoffPolicy {
            min_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(400),
        },
        DwellTimeouts::default(),
    );
    let offers = OfferPool::new(
        Duration::from_secs(300),
        Duration::from_secs(60),
        metrics.clone(),
    );
    let drain_offers = offers.clone();
    tracker.set_drain_listener(Arc::new(move |host| drain_offers.mark_host_drained(host)));

    let scheduler = Arc::new(Scheduler::new(
        tree.clone(),
        tracker.clone(),
        metrics.clone(),
        Duration::from_millis(10),
        1_000,
    ));

    let store = EmbeddedStore::open_in_memory().unwrap();
    let cm = Arc::new(ScriptedCm::default());
    let retry = regatta_core::RetryPolicy {
        max_attempts: 2,
        min_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        max_elapsed: Duration::ZERO,
    };

    let driver = GoalStateDriver::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        tracker.clone(),
        scheduler.clone(),
        cm.clone(),
        DriverConfig {
            worker_count: 1,
            requeue_delay: Duration::ZERO,
            max_task_retries: 2,
            retry,
        },
    );

    let notify_driver = driver.clone();
    let launcher = Arc::new(
        Launcher::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            cm.clone(),
            tracker.clone(),
            tree.clone(),
            offers.clone(),
            metrics.clone(),
            retry,
        )
        .with_notifier(Arc::new(move |id| {
            notify_driver.enqueue_task(id, Duration::ZERO);
        })),
    );

    let engine = PlacementEngine::new(
        tree.clone(),
        offers.clone(),
        tracker.clone(),
        launcher,
        strategy_for(PlacementStrategyKind::Batch),
        metrics.clone(),
        EngineConfig {
            task_type: TaskType::Batch,
            concurrency: 1,
            dequeue_limit: 10,
            dequeue_timeout: Duration::from_millis(20),
            max_rounds: 1,
            max_duration: Duration::from_millis(100),
            round_delay: Duration::from_millis(10),
        },
    );

    Pipeline {
        store,
        metrics,
        tree,
        tracker,
        offers,
        scheduler,
        engine,
        driver,
        cm,
    }
}

/// Submit a job the way the API front door does.
async fn submit_job(p: &Pipeline, job_id: &str, instances: u32, volume: Option<VolumeSpec>) {
    let mut default_task = TaskSpec {
        volume,
        ..Default::default()
    };
    default_task.resources.scalar = Resources::new(1.0, 100.0, 0.0, 0.0);
    default_task.resources.num_ports = 1;

    let spec = JobSpec {
        id: job_id.to_string(),
        name: job_id.to_string(),
        owning_team: "infra".to_string(),
        labels: HashMap::new(),
        respool_id: "leaf".to_string(),
        job_type: JobType::Batch,
        sla: Sla::default(),
        default_task,
        instance_overrides: HashMap::new(),
        instance_count: instances,
    };
    p.store.create_job(&spec, &JobRuntime::new(1_000)).await.unwrap();

    let mut runtimes = HashMap::new();
    let mut gangs = Vec::new();
    for idx in 0..instances {
        let tid = task_id(job_id, idx);
        let runtime = TaskRuntime::new(&tid);
        gangs.push(regatta_core::Gang::of(vec![regatta_core::TaskDesc {
            id: tid.clone(),
            job_id: job_id.to_string(),
            instance_idx: idx,
            task_type: TaskType::Batch,
            respool_id: "leaf".to_string(),
            priority: 0,
            preemptible: true,
            spec: spec.task_spec(idx).clone(),
            cm_task_id: runtime.cm_task_id.clone(),
        }]));
        runtimes.insert(idx, runtime);
    }
    p.store.create_task_runtimes(&job_id.to_string(), &runtimes).await.unwrap();
    p.scheduler.submit_gangs(&"leaf".to_string(), gangs).unwrap();
}

fn offer(id: &str, host: &str, cpu: f64, mem: f64) -> HostOffer {
    HostOffer {
        id: id.to_string(),
        hostname: host.to_string(),
        agent_id: format!("agent-{host}"),
        resources: Resources::new(cpu, mem, 0.0, 0.0),
        ports: vec![100, 101, 102],
        attributes: HashMap::new(),
        expiry: 0,
    }
}

async fn admit_and_place(p: &Pipeline) {
    assert!(p.scheduler.tick() > 0, "nothing admitted");
    let gangs = p
        .tree
        .dequeue_gangs(10, TaskType::Batch, Duration::from_millis(50))
        .await;
    for gang in gangs {
        p.engine.place_gang(gang).await;
    }
}

#[tokio::test]
async fn happy_path_batch_launch() {
    let p = build_pipeline();
    submit_job(&p, "job-a", 1, None).await;
    p.offers.add_offers(vec![offer("o1", "h0", 10.0, 10_000.0)]);

    admit_and_place(&p).await;

    // Exactly one launch on h0 carrying port 100.
    let launches = p.cm.launches.lock().unwrap();
    assert_eq!(launches.len(), 1);
    let (host, tasks) = &launches[0];
    assert_eq!(host, "h0");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].ports, vec![100]);
    drop(launches);

    // Task walked Pending -> ... -> Launched; runtime persisted with host.
    let id = "job-a-0".to_string();
    let handle = p.tracker.get_task(&id).unwrap();
    assert_eq!(handle.lock().unwrap().state(), TaskState::Launched);
    let runtime = p.store.get_task_by_id(&id).await.unwrap();
    assert_eq!(runtime.state, TaskState::Launched);
    assert_eq!(runtime.host.as_deref(), Some("h0"));

    // Launch consumed the offers and counted once.
    assert_eq!(p.offers.host_count(), 0);
    assert_eq!(
        p.metrics
            .launches_total
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn invalid_offers_reenqueues_gang() {
    let p = build_pipeline();
    submit_job(&p, "job-a", 1, None).await;
    p.offers.add_offers(vec![offer("o1", "h0", 10.0, 10_000.0)]);
    *p.cm.reject.lock().unwrap() = Some(CmRejectKind::InvalidOffers);

    let id = "job-a-0".to_string();
    let old_cm_id = p.store.get_task_by_id(&id).await.unwrap().cm_task_id;

    admit_and_place(&p).await;

    // No launch happened.
    assert!(p.cm.launches.lock().unwrap().is_empty());
    assert_eq!(
        p.metrics
            .launches_total
            .load(std::sync::atomic::Ordering::Relaxed),
        0
    );

    // Runtime carries the rejection reason and a regenerated CM id.
    let runtime = p.store.get_task_by_id(&id).await.unwrap();
    assert_eq!(runtime.reason, "HOST_REJECT_OFFER");
    assert_ne!(runtime.cm_task_id, old_cm_id);

    // Gang waits in the ready queue for another round.
    let status = p.tree.pool_status(&"leaf".to_string()).unwrap();
    assert_eq!(status.ready_gangs, 1);
}

#[tokio::test]
async fn killed_during_placement_never_launches() {
    let p = build_pipeline();
    submit_job(&p, "job-a", 1, None).await;
    p.offers.add_offers(vec![offer("o1", "h0", 10.0, 10_000.0)]);

    // Kill lands while the gang is queued for placement.
    let id = "job-a-0".to_string();
    let mut runtime = p.store.get_task_by_id(&id).await.unwrap();
    runtime.goal_state = TaskState::Killed;
    p.store.update_task_runtime(&id, &runtime).await.unwrap();

    admit_and_place(&p).await;

    // The launcher skipped the task and surrendered the offers.
    assert!(p.cm.launches.lock().unwrap().is_empty());
    assert_eq!(p.offers.host_state("h0"), Some(HostState::Ready));

    // The goal-state driver finishes the kill locally.
    p.driver.step_task(&id).await.unwrap();
    let runtime = p.store.get_task_by_id(&id).await.unwrap();
    assert_eq!(runtime.state, TaskState::Killed);
    assert!(p.cm.kills.lock().unwrap().is_empty());
}

#[tokio::test]
async fn no_matching_offer_backs_off_and_retries() {
    let p = build_pipeline();
    submit_job(&p, "job-a", 1, None).await;
    // No offers at all.

    admit_and_place(&p).await;

    // Gang is parked in ready with a backoff gate.
    let id = "job-a-0".to_string();
    let handle = p.tracker.get_task(&id).unwrap();
    {
        let task = handle.lock().unwrap();
        assert_eq!(task.state(), TaskState::Ready);
        assert!(task.backoff().current() >= Duration::from_millis(50));
    }
    assert_eq!(
        p.metrics
            .placement_retries_total
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );

    // An immediate dequeue sees nothing (backoff gate).
    let gangs = p
        .tree
        .dequeue_gangs(10, TaskType::Batch, Duration::from_millis(10))
        .await;
    assert!(gangs.is_empty());

    // After the gate passes and an offer arrives, placement succeeds.
    tokio::time::sleep(Duration::from_millis(60)).await;
    p.offers.add_offers(vec![offer("o1", "h0", 10.0, 10_000.0)]);
    let gangs = p
        .tree
        .dequeue_gangs(10, TaskType::Batch, Duration::from_millis(50))
        .await;
    assert_eq!(gangs.len(), 1);
    for gang in gangs {
        p.engine.place_gang(gang).await;
    }
    assert_eq!(p.cm.launches.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn stateful_task_with_created_volume_launches_only() {
    let p = build_pipeline();
    submit_job(
        &p,
        "job-a",
        1,
        Some(VolumeSpec {
            container_path: "/data".to_string(),
            size_mb: 128,
        }),
    )
    .await;
    use regatta_state::VolumeStore as _;
    p.store
        .create_persistent_volume(&regatta_core::PersistentVolume {
            id: "job-a-0".to_string(),
            job_id: "job-a".to_string(),
            instance_idx: 0,
            container_path: "/data".to_string(),
            size_mb: 128,
            state: regatta_core::VolumeState::Created,
        })
        .await
        .unwrap();
    p.offers.add_offers(vec![offer("o1", "h0", 10.0, 10_000.0)]);

    admit_and_place(&p).await;

    let operations = p.cm.operations.lock().unwrap();
    assert_eq!(operations.len(), 1);
    assert_eq!(operations[0].len(), 1);
    assert!(matches!(operations[0][0], OfferOperation::Launch { .. }));
}

#[tokio::test]
async fn host_drain_fires_once_when_last_task_leaves() {
    let p = build_pipeline();
    submit_job(&p, "job-a", 2, None).await;

    // Place the two single-task gangs on h1 one after the other; each
    // launch consumes the host's offers, so feed it a fresh one between.
    assert!(p.scheduler.tick() > 0);
    let gangs = p
        .tree
        .dequeue_gangs(10, TaskType::Batch, Duration::from_millis(50))
        .await;
    assert_eq!(gangs.len(), 2);
    for (i, gang) in gangs.into_iter().enumerate() {
        p.offers
            .add_offers(vec![offer(&format!("o{i}"), "h1", 10.0, 10_000.0)]);
        p.engine.place_gang(gang).await;
    }
    assert_eq!(p.cm.launches.lock().unwrap().len(), 2);

    // Count drain notifications from here on.
    let drains = Arc::new(Mutex::new(Vec::<String>::new()));
    let drains_clone = drains.clone();
    p.tracker
        .set_drain_listener(Arc::new(move |host| {
            drains_clone.lock().unwrap().push(host.to_string());
        }));

    // Complete both tasks; only the second completion drains the host.
    for idx in 0..2 {
        let id = task_id("job-a", idx);
        let cm_id = p
            .tracker
            .get_task(&id)
            .map(|h| h.lock().unwrap().desc().cm_task_id.clone());
        p.tracker.mark_done(&id, &cm_id.unwrap()).unwrap();
    }
    assert_eq!(p.tracker.size(), 0);
    assert_eq!(drains.lock().unwrap().as_slice(), &["h1".to_string()]);
}

#[tokio::test]
async fn terminal_statuses_converge_job_state() {
    let p = build_pipeline();
    submit_job(&p, "job-a", 1, None).await;
    p.offers.add_offers(vec![offer("o1", "h0", 10.0, 10_000.0)]);
    admit_and_place(&p).await;

    // CM reports success; mirror what the event processor does.
    let id = "job-a-0".to_string();
    let mut runtime = p.store.get_task_by_id(&id).await.unwrap();
    runtime.state = TaskState::Succeeded;
    p.store.update_task_runtime(&id, &runtime).await.unwrap();
    let cm_id = runtime.cm_task_id.clone();
    // In-memory lifecycle follows the stream.
    for state in [TaskState::Starting, TaskState::Running, TaskState::Succeeded] {
        let _ = p.tracker.transition(&id, state, "status", "");
    }
    p.tracker.mark_done(&id, &cm_id).unwrap();

    p.driver.step_task(&id).await.unwrap();
    p.driver.step_job(&"job-a".to_string()).await.unwrap();

    let job = p.store.get_job_runtime(&"job-a".to_string()).await.unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    assert!(job.completion_time.is_some());

    // Pool allocation fully returned.
    let status = p.tree.pool_status(&"leaf".to_string()).unwrap();
    assert_eq!(status.allocation, Resources::ZERO);
}
