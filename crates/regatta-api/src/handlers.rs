//! REST API handlers.
//!
//! Each handler reads/writes through the store traits and pokes the
//! scheduler or the goal-state driver where a mutation starts work.
//! Responses use a uniform `{ success, data, error }` wrapper.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use regatta_core::{
    epoch_secs, task_id, Error, Gang, JobRuntime, JobSpec, JobState, JobType, PoolSpec, Sla,
    TaskDesc, TaskRuntime, TaskSpec, TaskState,
};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> axum::response::Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// Map a control-plane error onto the user-visible failure set.
fn error_status(e: &Error) -> StatusCode {
    match e {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::AlreadyExists(_) | Error::Conflict(_) => StatusCode::CONFLICT,
        Error::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn from_error(e: Error) -> axum::response::Response {
    error_response(&e.to_string(), error_status(&e))
}

// ── Jobs ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub name: String,
    pub owning_team: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub respool_id: String,
    pub job_type: JobType,
    #[serde(default)]
    pub sla: Sla,
    pub default_task: TaskSpec,
    #[serde(default)]
    pub instance_overrides: HashMap<u32, TaskSpec>,
    pub instance_count: u32,
}

#[derive(Serialize)]
pub struct JobView {
    pub spec: JobSpec,
    pub runtime: JobRuntime,
}

/// POST /api/v1/jobs
pub async fn create_job(
    State(state): State<ApiState>,
    Json(req): Json<CreateJobRequest>,
) -> impl IntoResponse {
    if !state.tree.contains(&req.respool_id) {
        return error_response(
            &format!("no such resource pool: {}", req.respool_id),
            StatusCode::BAD_REQUEST,
        );
    }

    let job_id = uuid::Uuid::new_v4().to_string();
    let spec = JobSpec {
        id: job_id.clone(),
        name: req.name,
        owning_team: req.owning_team,
        labels: req.labels,
        respool_id: req.respool_id.clone(),
        job_type: req.job_type,
        sla: req.sla,
        default_task: req.default_task,
        instance_overrides: req.instance_overrides,
        instance_count: req.instance_count,
    };
    if let Err(e) = spec.validate() {
        return error_response(&e, StatusCode::BAD_REQUEST);
    }

    // Service-like workloads converge on Running; batch runs to completion.
    let goal = match spec.job_type {
        JobType::Batch => TaskState::Succeeded,
        _ => TaskState::Running,
    };

    let mut runtimes = HashMap::new();
    let mut gangs = Vec::new();
    for idx in 0..spec.instance_count {
        let tid = task_id(&job_id, idx);
        let mut runtime = TaskRuntime::new(&tid);
        runtime.goal_state = goal;
        gangs.push(Gang::of(vec![TaskDesc {
            id: tid.clone(),
            job_id: job_id.clone(),
            instance_idx: idx,
            task_type: spec.job_type.into(),
            respool_id: spec.respool_id.clone(),
            priority: spec.sla.priority,
            preemptible: spec.sla.preemptible,
            spec: spec.task_spec(idx).clone(),
            cm_task_id: runtime.cm_task_id.clone(),
        }]));
        runtimes.insert(idx, runtime);
    }

    let mut job_runtime = JobRuntime::new(epoch_secs());
    job_runtime.state = JobState::Pending;
    job_runtime.goal_state = match spec.job_type {
        JobType::Batch => JobState::Succeeded,
        _ => JobState::Running,
    };

    if let Err(e) = state.jobs.create_job(&spec, &job_runtime).await {
        return from_error(e.into());
    }
    if let Err(e) = state.tasks.create_task_runtimes(&job_id, &runtimes).await {
        return from_error(e.into());
    }
    if let Err(e) = state.scheduler.submit_gangs(&spec.respool_id, gangs) {
        return from_error(e.into());
    }
    state.driver.enqueue_job(&job_id, Duration::ZERO);

    info!(%job_id, name = %spec.name, instances = spec.instance_count, "job created");
    (
        StatusCode::CREATED,
        ApiResponse::ok(JobView {
            spec,
            runtime: job_runtime,
        }),
    )
        .into_response()
}

/// GET /api/v1/jobs/{id}
pub async fn get_job(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    let spec = match state.jobs.get_job_config(&id).await {
        Ok(spec) => spec,
        Err(e) => return from_error(e.into()),
    };
    match state.jobs.get_job_runtime(&id).await {
        Ok(runtime) => ApiResponse::ok(JobView { spec, runtime }).into_response(),
        Err(e) => from_error(e.into()),
    }
}

#[derive(Deserialize)]
pub struct JobQuery {
    pub respool_id: Option<String>,
}

/// GET /api/v1/jobs
pub async fn query_jobs(
    State(state): State<ApiState>,
    Query(query): Query<JobQuery>,
) -> impl IntoResponse {
    match state.jobs.query_jobs(query.respool_id.as_ref()).await {
        Ok(jobs) => ApiResponse::ok(jobs).into_response(),
        Err(e) => from_error(e.into()),
    }
}

/// PUT /api/v1/jobs/{id}
pub async fn update_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(spec): Json<JobSpec>,
) -> impl IntoResponse {
    if spec.id != id {
        return error_response("job id is immutable", StatusCode::BAD_REQUEST);
    }
    let current = match state.jobs.get_job_config(&id).await {
        Ok(current) => current,
        Err(e) => return from_error(e.into()),
    };
    if let Err(e) = spec.validate_update(&current) {
        return error_response(&e, StatusCode::BAD_REQUEST);
    }
    match state.jobs.update_job_config(&spec).await {
        Ok(()) => {
            state.driver.enqueue_job(&id, Duration::ZERO);
            ApiResponse::ok(spec).into_response()
        }
        Err(e) => from_error(e.into()),
    }
}

/// DELETE /api/v1/jobs/{id}
pub async fn delete_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let runtime = match state.jobs.get_job_runtime(&id).await {
        Ok(rt) => rt,
        Err(e) => return from_error(e.into()),
    };
    if !runtime.state.is_terminal() {
        return error_response(
            "job is still active; stop its tasks first",
            StatusCode::CONFLICT,
        );
    }
    if let Err(e) = state.jobs.delete_job(&id).await {
        return from_error(e.into());
    }
    if let Err(e) = state.tasks.delete_tasks_for_job(&id).await {
        return from_error(e.into());
    }
    info!(job_id = %id, "job deleted");
    ApiResponse::ok("deleted").into_response()
}

// ── Tasks ──────────────────────────────────────────────────────────

/// GET /api/v1/tasks/{id}
pub async fn get_task(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.tasks.get_task_by_id(&id).await {
        Ok(runtime) => ApiResponse::ok(runtime).into_response(),
        Err(e) => from_error(e.into()),
    }
}

#[derive(Deserialize)]
pub struct TaskQuery {
    pub state: Option<TaskState>,
}

/// GET /api/v1/jobs/{id}/tasks[?state=]
pub async fn list_job_tasks(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<TaskQuery>,
) -> impl IntoResponse {
    match state.tasks.get_tasks_for_job(&id).await {
        Ok(mut tasks) => {
            if let Some(filter) = query.state {
                tasks.retain(|_, rt| rt.state == filter);
            }
            ApiResponse::ok(tasks).into_response()
        }
        Err(e) => from_error(e.into()),
    }
}

/// Where a task's sandbox lives on the fleet.
#[derive(Serialize)]
pub struct SandboxLocation {
    pub host: Option<String>,
    pub agent_id: Option<String>,
    pub cm_task_id: String,
    pub prev_cm_task_ids: Vec<String>,
}

/// GET /api/v1/tasks/{id}/sandbox
///
/// Returns the coordinates needed to browse the task's sandbox on its
/// agent; the file listing itself is served by the cluster manager.
pub async fn browse_sandbox(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.tasks.get_task_by_id(&id).await {
        Ok(runtime) => ApiResponse::ok(SandboxLocation {
            host: runtime.host,
            agent_id: runtime.agent_id,
            cm_task_id: runtime.cm_task_id,
            prev_cm_task_ids: runtime.prev_cm_task_ids,
        })
        .into_response(),
        Err(e) => from_error(e.into()),
    }
}

/// Set a task's goal state and hand it to the goal-state driver.
async fn set_task_goal(
    state: &ApiState,
    id: &str,
    goal: TaskState,
    reset_failures: bool,
) -> Result<TaskRuntime, Error> {
    let mut runtime = state.tasks.get_task_by_id(&id.to_string()).await?;
    runtime.goal_state = goal;
    if reset_failures {
        runtime.fail_count = 0;
    }
    state
        .tasks
        .update_task_runtime(&id.to_string(), &runtime)
        .await?;
    state.driver.enqueue_task(&id.to_string(), Duration::ZERO);
    Ok(runtime)
}

/// POST /api/v1/tasks/{id}/stop
pub async fn stop_task(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match set_task_goal(&state, &id, TaskState::Killed, false).await {
        Ok(runtime) => {
            info!(task_id = %id, "task stop requested");
            ApiResponse::ok(runtime).into_response()
        }
        Err(e) => from_error(e),
    }
}

/// POST /api/v1/tasks/{id}/start
pub async fn start_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match set_task_goal(&state, &id, TaskState::Running, true).await {
        Ok(runtime) => ApiResponse::ok(runtime).into_response(),
        Err(e) => from_error(e),
    }
}

/// POST /api/v1/tasks/{id}/restart
pub async fn restart_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    // Stop first; the driver restarts it once the kill lands because the
    // goal flips back to Running.
    if let Err(e) = set_task_goal(&state, &id, TaskState::Killed, true).await {
        return from_error(e);
    }
    match set_task_goal(&state, &id, TaskState::Running, true).await {
        Ok(runtime) => ApiResponse::ok(runtime).into_response(),
        Err(e) => from_error(e),
    }
}

// ── Resource pools ─────────────────────────────────────────────────

/// POST /api/v1/respools
pub async fn create_respool(
    State(state): State<ApiState>,
    Json(spec): Json<PoolSpec>,
) -> impl IntoResponse {
    if let Err(e) = state.tree.create_pool(spec.clone()) {
        return from_error(e.into());
    }
    if let Err(e) = state.pools.create_resource_pool(&spec).await {
        return from_error(e.into());
    }
    info!(pool_id = %spec.id, "resource pool created");
    (StatusCode::CREATED, ApiResponse::ok(spec)).into_response()
}

/// GET /api/v1/respools
pub async fn list_respools(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.tree.list_pools()).into_response()
}

/// PUT /api/v1/respools/{id}
pub async fn update_respool(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(spec): Json<PoolSpec>,
) -> impl IntoResponse {
    if spec.id != id {
        return error_response("pool id is immutable", StatusCode::BAD_REQUEST);
    }
    if let Err(e) = state.tree.update_pool(spec.clone()) {
        return from_error(e.into());
    }
    if let Err(e) = state.pools.update_resource_pool(&spec).await {
        return from_error(e.into());
    }
    ApiResponse::ok(spec).into_response()
}

/// GET /api/v1/respools/{id}
pub async fn get_respool(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.tree.pool_status(&id) {
        Ok(status) => ApiResponse::ok(status).into_response(),
        Err(e) => from_error(e.into()),
    }
}

/// DELETE /api/v1/respools/{id}
pub async fn delete_respool(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = state.tree.delete_pool(&id) {
        return from_error(e.into());
    }
    if let Err(e) = state.pools.delete_resource_pool(&id).await {
        return from_error(e.into());
    }
    ApiResponse::ok("deleted").into_response()
}

// ── Volumes ────────────────────────────────────────────────────────

/// GET /api/v1/volumes
pub async fn list_volumes(State(state): State<ApiState>) -> impl IntoResponse {
    match state.volumes.list_persistent_volumes().await {
        Ok(volumes) => ApiResponse::ok(volumes).into_response(),
        Err(e) => from_error(e.into()),
    }
}

/// GET /api/v1/volumes/{id}
pub async fn get_volume(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.volumes.get_persistent_volume(&id).await {
        Ok(volume) => ApiResponse::ok(volume).into_response(),
        Err(e) => from_error(e.into()),
    }
}

/// DELETE /api/v1/volumes/{id}
pub async fn delete_volume(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.volumes.delete_persistent_volume(&id).await {
        Ok(()) => ApiResponse::ok("deleted").into_response(),
        Err(e) => from_error(e.into()),
    }
}

// ── Health & metrics ───────────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let body = regatta_core::metrics::render_prometheus(&state.metrics);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
