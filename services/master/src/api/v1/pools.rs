//! Pool summaries and task submission.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use gantry_events::{AllocationState, Colocation, DeviceKind, ResourceSpec, TaskType};
use gantry_id::AllocationId;
use serde::{Deserialize, Serialize};

use super::problem;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::master::{Master, PoolSummary};
use crate::pool::TaskRequest;

const DEFAULT_REQUESTER: &str = "anonymous";

#[derive(Debug, Serialize)]
pub struct PoolsResponse {
    pub items: Vec<PoolSummary>,
}

/// Body of a task submission.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitTaskRequest {
    pub slots: u32,

    /// `cpu`, `gpu`, or `gpu:<class>`.
    #[serde(default = "default_device")]
    pub device: DeviceKind,

    #[serde(default)]
    pub colocation: Colocation,

    /// Defaults to the pool's configured priority.
    #[serde(default)]
    pub priority: Option<i32>,

    #[serde(default)]
    pub weight: Option<f64>,

    #[serde(default)]
    pub task_type: TaskType,

    #[serde(default)]
    pub name: Option<String>,

    /// Overrides the requester header.
    #[serde(default)]
    pub requester: Option<String>,
}

fn default_device() -> DeviceKind {
    DeviceKind::Cpu
}

#[derive(Debug, Serialize)]
pub struct SubmitTaskResponse {
    pub allocation_id: AllocationId,
    pub pool: String,
    #[serde(flatten)]
    pub state: AllocationState,
}

/// GET /v1/pools
pub async fn list_pools(State(master): State<Master>) -> impl IntoResponse {
    Json(PoolsResponse {
        items: master.pool_summaries(),
    })
}

/// POST /v1/pools/{pool}/tasks
pub async fn submit_task(
    State(master): State<Master>,
    ctx: RequestContext,
    Path(pool): Path<String>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;

    let resource_pool = master.pool(&pool).map_err(|e| problem(&request_id)(e.into()))?;
    let default_priority = resource_pool.config().scheduler.default_priority();

    let requester = req
        .requester
        .or(ctx.requester)
        .unwrap_or_else(|| DEFAULT_REQUESTER.to_string());
    let mut builder = TaskRequest::builder(pool)
        .requester(requester)
        .task_type(req.task_type)
        .resources(ResourceSpec::new(req.slots, req.device, req.colocation))
        .priority(req.priority.unwrap_or(default_priority))
        .submitted_at(Utc::now());
    if let Some(weight) = req.weight {
        builder = builder.weight(weight);
    }
    if let Some(name) = req.name {
        builder = builder.name(name);
    }

    let allocation = master
        .submit(builder.build())
        .await
        .map_err(problem(&request_id))?;

    tracing::info!(
        request_id = %request_id,
        allocation_id = %allocation.id,
        pool = %allocation.pool(),
        "Task submitted"
    );

    Ok((
        StatusCode::CREATED,
        Json(SubmitTaskResponse {
            allocation_id: allocation.id,
            pool: allocation.request.pool,
            state: allocation.state,
        }),
    ))
}
