//! regatta-api — REST RPC surface for the control plane.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/jobs` | Submit a job |
//! | GET | `/api/v1/jobs` | Query jobs (`?respool_id=`) |
//! | GET | `/api/v1/jobs/{id}` | Get job spec + runtime |
//! | PUT | `/api/v1/jobs/{id}` | Update job config |
//! | DELETE | `/api/v1/jobs/{id}` | Delete a terminal job |
//! | GET | `/api/v1/jobs/{id}/tasks` | List task runtimes (`?state=`) |
//! | GET | `/api/v1/tasks/{id}` | Get one task runtime |
//! | GET | `/api/v1/tasks/{id}/sandbox` | Sandbox coordinates |
//! | POST | `/api/v1/tasks/{id}/stop` | Request kill |
//! | POST | `/api/v1/tasks/{id}/start` | Request (re)start |
//! | POST | `/api/v1/tasks/{id}/restart` | Kill then restart |
//! | POST | `/api/v1/respools` | Create a resource pool |
//! | GET | `/api/v1/respools` | List pools with usage |
//! | GET | `/api/v1/respools/{id}` | Pool status |
//! | PUT | `/api/v1/respools/{id}` | Update pool tunables |
//! | DELETE | `/api/v1/respools/{id}` | Delete a pool |
//! | GET | `/api/v1/volumes` | List persistent volumes |
//! | GET | `/api/v1/volumes/{id}` | Get a volume |
//! | DELETE | `/api/v1/volumes/{id}` | Delete a volume |
//! | GET | `/healthz` | Liveness |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use regatta_core::metrics::SchedulerMetrics;
use regatta_goalstate::GoalStateDriver;
use regatta_respool::{PoolTree, Scheduler};
use regatta_state::{JobStore, ResourcePoolStore, TaskStore, VolumeStore};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub jobs: Arc<dyn JobStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub pools: Arc<dyn ResourcePoolStore>,
    pub volumes: Arc<dyn VolumeStore>,
    pub tree: Arc<PoolTree>,
    pub scheduler: Arc<Scheduler>,
    pub driver: Arc<GoalStateDriver>,
    pub metrics: Arc<SchedulerMetrics>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/jobs", post(handlers::create_job).get(handlers::query_jobs))
        .route(
            "/jobs/{id}",
            get(handlers::get_job)
                .put(handlers::update_job)
                .delete(handlers::delete_job),
        )
        .route("/jobs/{id}/tasks", get(handlers::list_job_tasks))
        .route("/tasks/{id}", get(handlers::get_task))
        .route("/tasks/{id}/sandbox", get(handlers::browse_sandbox))
        .route("/tasks/{id}/stop", post(handlers::stop_task))
        .route("/tasks/{id}/start", post(handlers::start_task))
        .route("/tasks/{id}/restart", post(handlers::restart_task))
        .route(
            "/respools",
            post(handlers::create_respool).get(handlers::list_respools),
        )
        .route(
            "/respools/{id}",
            get(handlers::get_respool)
                .put(handlers::update_respool)
                .delete(handlers::delete_respool),
        )
        .route("/volumes", get(handlers::list_volumes))
        .route(
            "/volumes/{id}",
            get(handlers::get_volume).delete(handlers::delete_volume),
        )
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
