//! Agent lifecycle endpoints: handshake, heartbeat, drain, exit reports.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use gantry_events::{AllocationState, DeviceKind};
use gantry_id::{AgentId, AllocationId};
use serde::{Deserialize, Serialize};

use super::{parse_agent_id, parse_allocation_id, problem};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::master::Master;
use crate::registry::{AgentRegistration, AgentView};

#[derive(Debug, Serialize)]
pub struct AgentsResponse {
    pub items: Vec<AgentView>,
}

/// Agent handshake.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterAgentRequest {
    pub agent_id: AgentId,
    pub pool: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Base URL the master uses to command the agent.
    #[serde(default)]
    pub rpc_url: Option<String>,
    /// Ordered slot list; position is the slot index.
    pub slots: Vec<DeviceKind>,
    /// Allocations the agent is still running.
    #[serde(default)]
    pub running: Vec<AllocationId>,
}

#[derive(Debug, Serialize)]
pub struct RegisterAgentResponse {
    pub agent_id: AgentId,
    pub pool: String,
    pub slots: usize,
    /// Interval the agent should heartbeat at.
    pub heartbeat_interval_secs: u64,
}

/// An agent's report that an allocation's process ended.
#[derive(Debug, Deserialize)]
pub struct ExitReport {
    pub success: bool,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct ExitResponse {
    pub allocation_id: AllocationId,
    pub accepted: bool,
    #[serde(flatten)]
    pub state: Option<AllocationState>,
}

/// GET /v1/agents
pub async fn list_agents(State(master): State<Master>) -> impl IntoResponse {
    Json(AgentsResponse {
        items: master.agents(),
    })
}

/// POST /v1/agents
pub async fn register_agent(
    State(master): State<Master>,
    ctx: RequestContext,
    Json(req): Json<RegisterAgentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    let agent_id = req.agent_id;
    let pool = req.pool.clone();
    let slots = req.slots.len();

    let registration = AgentRegistration {
        agent_id,
        pool: req.pool,
        labels: req.labels,
        rpc_url: req.rpc_url,
        slots: req.slots,
    };
    master
        .register_agent(registration, &req.running)
        .await
        .map_err(problem(&request_id))?;

    tracing::info!(
        request_id = %request_id,
        %agent_id,
        pool = %pool,
        slots,
        running = req.running.len(),
        "Agent registered"
    );

    // Heartbeat well inside the timeout.
    let heartbeat_interval_secs = (master.settings().heartbeat_timeout.as_secs() / 3).max(1);
    Ok((
        StatusCode::OK,
        Json(RegisterAgentResponse {
            agent_id,
            pool,
            slots,
            heartbeat_interval_secs,
        }),
    ))
}

/// DELETE /v1/agents/{agent_id}
pub async fn deregister_agent(
    State(master): State<Master>,
    ctx: RequestContext,
    Path(agent_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let request_id = ctx.request_id;
    let agent_id = parse_agent_id(&agent_id, &request_id)?;
    master
        .deregister_agent(&agent_id)
        .await
        .map_err(problem(&request_id))?;
    tracing::info!(request_id = %request_id, %agent_id, "Agent deregistered");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/agents/{agent_id}/heartbeat
pub async fn heartbeat(
    State(master): State<Master>,
    ctx: RequestContext,
    Path(agent_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let request_id = ctx.request_id;
    let agent_id = parse_agent_id(&agent_id, &request_id)?;
    master.heartbeat(&agent_id).map_err(problem(&request_id))?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /v1/agents/{agent_id}/drain
pub async fn drain(
    State(master): State<Master>,
    ctx: RequestContext,
    Path(agent_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let request_id = ctx.request_id;
    let agent_id = parse_agent_id(&agent_id, &request_id)?;
    master.drain(&agent_id).map_err(problem(&request_id))?;
    tracing::info!(request_id = %request_id, %agent_id, "Agent draining");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /v1/agents/{agent_id}/allocations/{allocation_id}/exit
pub async fn report_exit(
    State(master): State<Master>,
    ctx: RequestContext,
    Path((agent_id, allocation_id)): Path<(String, String)>,
    Json(report): Json<ExitReport>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    let agent_id = parse_agent_id(&agent_id, &request_id)?;
    let allocation_id = parse_allocation_id(&allocation_id, &request_id)?;

    let state = master
        .agent_exited(agent_id, allocation_id, report.success, report.exit_code)
        .await
        .map_err(problem(&request_id))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ExitResponse {
            allocation_id,
            accepted: state.is_some(),
            state,
        }),
    ))
}
