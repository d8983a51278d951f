//! Subsystem wiring.
//!
//! Builds the full control plane from a merged configuration: store,
//! pool tree, tracker, offer pool, admission scheduler, placement
//! engines, launcher, goal-state driver, leader-gated server and the
//! REST API, all sharing one shutdown fan-out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use regatta_api::ApiState;
use regatta_cluster::Server;
use regatta_core::config::Config;
use regatta_core::metrics::SchedulerMetrics;
use regatta_core::{JobState, PoolSpec, TaskState};
use regatta_goalstate::{DriverConfig, GoalStateDriver};
use regatta_launcher::Launcher;
use regatta_offerpool::OfferPool;
use regatta_placement::{strategy_for, EngineConfig, PlacementEngine};
use regatta_respool::{PoolTree, Scheduler};
use regatta_state::{EmbeddedStore, JobStore, ResourcePoolStore, TaskStore};
use regatta_task::{BackoffPolicy, DwellTimeouts, ExpiredTask, Tracker};

use crate::events::EventProcessor;
use crate::loopback::{LoopbackCm, LoopbackConnection, LoopbackDetector, NoopHandler};
use crate::reconciler::TaskReconciler;

/// Root pool id used when the store holds no pool hierarchy yet.
const ROOT_POOL_ID: &str = "root";

pub struct Daemon {
    pub config: Config,
    pub store: EmbeddedStore,
    pub metrics: Arc<SchedulerMetrics>,
    pub tree: Arc<PoolTree>,
    pub tracker: Arc<Tracker>,
    pub offers: Arc<OfferPool>,
    pub scheduler: Arc<Scheduler>,
    pub launcher: Arc<Launcher>,
    pub driver: Arc<GoalStateDriver>,
    pub engines: Vec<Arc<PlacementEngine>>,
    pub server: Arc<Server>,
    pub processor: Arc<EventProcessor>,
    pub cm: Arc<LoopbackCm>,
}

impl Daemon {
    /// Wire every subsystem. The store must already be open.
    pub async fn build(config: Config, store: EmbeddedStore) -> anyhow::Result<Daemon> {
        let metrics = SchedulerMetrics::new();

        // ── Resource-pool tree (root + recovery from store) ────────
        let tree = PoolTree::new(root_spec(&config));
        let mut pending: Vec<PoolSpec> = store
            .list_resource_pools()
            .await?
            .into_iter()
            .filter(|p| p.id != ROOT_POOL_ID)
            .collect();
        // Parents before children; loop until no pool can be placed.
        loop {
            let before = pending.len();
            pending.retain(|spec| tree.create_pool(spec.clone()).is_err());
            if pending.is_empty() || pending.len() == before {
                break;
            }
        }
        for orphan in &pending {
            warn!(pool_id = %orphan.id, "stored pool not recovered (missing parent)");
        }
        info!(pools = tree.list_pools().len(), "resource-pool tree recovered");

        // ── Core components ────────────────────────────────────────
        let rm = &config.res_manager;
        let tracker = Tracker::new(
            tree.clone(),
            metrics.clone(),
            BackoffPolicy {
                min_backoff: Duration::from_millis(rm.placement_min_backoff_ms),
                max_backoff: Duration::from_millis(rm.placement_max_backoff_ms),
            },
            DwellTimeouts {
                placing: Duration::from_millis(rm.placing_timeout_ms),
                launching: Duration::from_millis(rm.launching_timeout_ms),
                preempting: Duration::from_millis(rm.preempting_timeout_ms),
            },
        );

        let hm = &config.host_manager;
        let offers = OfferPool::new(
            Duration::from_secs(hm.offer_hold_secs),
            Duration::from_secs(hm.pruning_period_secs),
            metrics.clone(),
        );

        // Tracker -> offer pool drain seam.
        let drain_offers = offers.clone();
        tracker.set_drain_listener(Arc::new(move |host| {
            drain_offers.mark_host_drained(host);
        }));

        let scheduler = Arc::new(Scheduler::new(
            tree.clone(),
            tracker.clone(),
            metrics.clone(),
            Duration::from_millis(rm.scheduling_period_ms),
            rm.ready_queue_limit,
        ));

        let cm = LoopbackCm::new();

        let jm = &config.job_manager;
        let driver = GoalStateDriver::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            tracker.clone(),
            scheduler.clone(),
            cm.clone(),
            DriverConfig {
                worker_count: jm.worker_count,
                requeue_delay: Duration::from_millis(jm.requeue_delay_ms),
                max_task_retries: jm.max_task_retries,
                retry: jm.retry_policy(),
            },
        );

        let notifier_driver = driver.clone();
        let launcher = Arc::new(
            Launcher::new(
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                cm.clone(),
                tracker.clone(),
                tree.clone(),
                offers.clone(),
                metrics.clone(),
                jm.retry_policy(),
            )
            .with_notifier(Arc::new(move |task_id| {
                notifier_driver.enqueue_task(task_id, Duration::ZERO);
            })),
        );

        // Offer pool -> CM decline seam.
        let decline_cm: Arc<LoopbackCm> = cm.clone();
        offers.set_decline_listener(Arc::new(move |pruned| {
            let decline_cm = decline_cm.clone();
            let ids = pruned.into_iter().map(|o| o.id).collect();
            tokio::spawn(async move {
                use regatta_cluster::ClusterManagerClient as _;
                if let Err(e) = decline_cm.decline_offers(ids).await {
                    warn!(error = %e, "offer decline failed");
                }
            });
        }));

        // ── Placement engines (one per configured task type) ───────
        let pc = &config.placement;
        let strategy = strategy_for(pc.strategy);
        let engines = pc
            .task_types
            .iter()
            .map(|task_type| {
                PlacementEngine::new(
                    tree.clone(),
                    offers.clone(),
                    tracker.clone(),
                    launcher.clone(),
                    strategy.clone(),
                    metrics.clone(),
                    EngineConfig {
                        task_type: *task_type,
                        concurrency: pc.concurrency,
                        dequeue_limit: pc.task_dequeue_limit,
                        dequeue_timeout: Duration::from_millis(pc.task_dequeue_timeout_ms),
                        max_rounds: pc.max_rounds.value(*task_type),
                        max_duration: pc.max_durations.value(*task_type),
                        round_delay: Duration::from_millis(100),
                    },
                )
            })
            .collect();

        // ── Subscription plumbing ──────────────────────────────────
        let processor = EventProcessor::new(
            offers.clone(),
            tracker.clone(),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            driver.clone(),
            cm.clone(),
        );
        cm.set_processor(processor.clone());

        let cmc = &config.cluster_manager;
        let reconciler = TaskReconciler::new(
            tracker.clone(),
            cm.clone(),
            Duration::from_secs(15 * 60),
        );
        let server = Arc::new(Server::new(
            Arc::new(LoopbackDetector),
            Arc::new(LoopbackConnection::default()),
            vec![
                Arc::new(NoopHandler("offer-event-handler")) as Arc<dyn regatta_cluster::Handler>,
                reconciler,
            ],
            Duration::from_millis(cmc.min_backoff_ms),
            Duration::from_millis(cmc.max_backoff_ms),
        ));

        Ok(Daemon {
            config,
            store,
            metrics,
            tree,
            tracker,
            offers,
            scheduler,
            launcher,
            driver,
            engines,
            server,
            processor,
            cm,
        })
    }

    /// Re-enqueue live jobs after a restart so the driver converges them.
    pub async fn recover(&self) -> anyhow::Result<()> {
        let live = self
            .store
            .get_jobs_by_states(&[JobState::Initialized, JobState::Pending, JobState::Running])
            .await?;
        for job in &live {
            self.driver.enqueue_job(&job.id, Duration::ZERO);
            let tasks = self.store.get_tasks_for_job(&job.id).await?;
            for idx in tasks.keys() {
                self.driver
                    .enqueue_task(&regatta_core::task_id(&job.id, *idx), Duration::ZERO);
            }
        }
        info!(jobs = live.len(), "recovery enqueued live jobs");
        Ok(())
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            jobs: Arc::new(self.store.clone()),
            tasks: Arc::new(self.store.clone()),
            pools: Arc::new(self.store.clone()),
            volumes: Arc::new(self.store.clone()),
            tree: self.tree.clone(),
            scheduler: self.scheduler.clone(),
            driver: self.driver.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Run every loop until Ctrl-C, then drain.
    pub async fn run(self, api_port: u16) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        let scheduler = self.scheduler.clone();
        let sched_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            scheduler.run(sched_shutdown).await;
        }));

        let offers = self.offers.clone();
        let pruner_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            offers.run_pruner(pruner_shutdown).await;
        }));

        handles.push(tokio::spawn(
            self.driver.clone().run(shutdown_rx.clone()),
        ));

        for engine in &self.engines {
            handles.push(tokio::spawn(engine.clone().run(shutdown_rx.clone())));
        }

        let server = self.server.clone();
        server.gained_leadership();
        let server_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            server.run(Duration::from_secs(1), server_shutdown).await;
        }));

        // Dwell-timeout sweeper: expired Placing goes back to ready,
        // expired launches go Lost and to the goal-state driver.
        let tracker = self.tracker.clone();
        let tree = self.tree.clone();
        let driver = self.driver.clone();
        let sweep_store = self.store.clone();
        let mut sweep_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        for expired in tracker.expire_timeouts() {
                            apply_expiry(&tree, &driver, &sweep_store, expired).await;
                        }
                    }
                    _ = sweep_shutdown.changed() => break,
                }
            }
        }));

        self.recover().await?;

        // ── REST API ───────────────────────────────────────────────
        let router = regatta_api::build_router(self.api_state());
        let addr = SocketAddr::from(([0, 0, 0, 0], api_port));
        info!(%addr, "API server starting");
        let listener = tokio::net::TcpListener::bind(addr).await?;

        let api_server = axum::serve(listener, router).with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        });
        api_server.await?;

        for handle in handles {
            let _ = handle.await;
        }
        info!("regatta daemon stopped");
        Ok(())
    }
}

fn root_spec(config: &Config) -> PoolSpec {
    PoolSpec {
        id: ROOT_POOL_ID.to_string(),
        parent_id: None,
        name: ROOT_POOL_ID.to_string(),
        reservation: config.res_manager.cluster_capacity,
        limit: config.res_manager.cluster_capacity,
        share_weight: 1.0,
        policy: Default::default(),
        preemptible: true,
    }
}

/// Route one expired task to its recovery path.
async fn apply_expiry(
    tree: &PoolTree,
    driver: &GoalStateDriver,
    store: &EmbeddedStore,
    expired: ExpiredTask,
) {
    match expired.to {
        TaskState::Ready => {
            let gang = regatta_core::Gang::of(vec![expired.desc]);
            if let Err(e) = tree.requeue_ready(gang, 0) {
                warn!(error = %e, "requeue of dwell-expired gang failed");
            }
        }
        TaskState::Lost => {
            // Mirror the loss into the store so the driver sees it.
            let id = expired.desc.id.clone();
            if let Ok(mut runtime) = store.get_task_by_id(&id).await {
                if runtime.cm_task_id == expired.desc.cm_task_id {
                    runtime.state = TaskState::Lost;
                    runtime.reason = "dwell_timeout".to_string();
                    runtime.message = format!("no update while {:?}", expired.from);
                    runtime.fail_count += 1;
                    let _ = store.update_task_runtime(&id, &runtime).await;
                }
            }
            driver.enqueue_task(&id, Duration::ZERO);
        }
        _ => {}
    }
}
