//! API v1 routes.

mod agents;
mod allocations;
mod logs;
mod pools;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use gantry_id::{AgentId, AllocationId};

use crate::api::error::ApiError;
use crate::error::MasterError;
use crate::master::Master;

pub fn routes() -> Router<Master> {
    Router::new()
        .route("/pools", get(pools::list_pools))
        .route("/pools/{pool}/tasks", post(pools::submit_task))
        .route("/allocations", get(allocations::list_allocations))
        .route("/allocations/{allocation_id}", get(allocations::get_allocation))
        .route("/allocations/{allocation_id}/ready", post(allocations::mark_ready))
        .route("/allocations/{allocation_id}/waiting", post(allocations::mark_waiting))
        .route("/allocations/{allocation_id}/cancel", post(allocations::cancel))
        .route(
            "/allocations/{allocation_id}/logs",
            get(logs::query_logs).post(logs::ingest_logs),
        )
        .route("/allocations/{allocation_id}/logs/stream", get(logs::stream_logs))
        .route("/allocations/{allocation_id}/logs/fields", get(logs::log_fields))
        .route("/agents", get(agents::list_agents).post(agents::register_agent))
        .route("/agents/{agent_id}", delete(agents::deregister_agent))
        .route("/agents/{agent_id}/heartbeat", post(agents::heartbeat))
        .route("/agents/{agent_id}/drain", put(agents::drain))
        .route(
            "/agents/{agent_id}/allocations/{allocation_id}/exit",
            post(agents::report_exit),
        )
}

fn parse_allocation_id(raw: &str, request_id: &str) -> Result<AllocationId, ApiError> {
    raw.parse().map_err(|_| {
        ApiError::bad_request("invalid_allocation_id", "Invalid allocation ID format")
            .with_request_id(request_id.to_string())
    })
}

fn parse_agent_id(raw: &str, request_id: &str) -> Result<AgentId, ApiError> {
    raw.parse().map_err(|_| {
        ApiError::bad_request("invalid_agent_id", "Invalid agent ID format")
            .with_request_id(request_id.to_string())
    })
}

/// Map a master error to a problem carrying the request id.
fn problem(request_id: &str) -> impl Fn(MasterError) -> ApiError + '_ {
    move |e| {
        let error = ApiError::from(e);
        if error.status.is_server_error() {
            tracing::error!(request_id = %request_id, detail = %error.problem.detail, "Request failed");
        }
        error.with_request_id(request_id.to_string())
    }
}
