//! Allocation queries and signals.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use gantry_events::AllocationState;
use gantry_id::AllocationId;
use serde::Serialize;

use super::{parse_allocation_id, problem};
use crate::allocation::{Allocation, AllocationDetail};
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::master::Master;

#[derive(Debug, Serialize)]
pub struct AllocationsResponse {
    pub items: Vec<Allocation>,
}

/// Reply to a signal or cancellation.
#[derive(Debug, Serialize)]
pub struct SignalResponse {
    pub allocation_id: AllocationId,
    /// False when the allocation is unknown or already finished.
    pub accepted: bool,
    #[serde(flatten)]
    pub state: Option<AllocationState>,
}

/// GET /v1/allocations
pub async fn list_allocations(State(master): State<Master>) -> impl IntoResponse {
    Json(AllocationsResponse {
        items: master.list_active().await,
    })
}

/// GET /v1/allocations/{allocation_id}
pub async fn get_allocation(
    State(master): State<Master>,
    ctx: RequestContext,
    Path(allocation_id): Path<String>,
) -> Result<Json<AllocationDetail>, ApiError> {
    let request_id = ctx.request_id;
    let allocation_id = parse_allocation_id(&allocation_id, &request_id)?;
    let detail = master
        .get(allocation_id)
        .await
        .map_err(problem(&request_id))?;
    Ok(Json(detail))
}

/// POST /v1/allocations/{allocation_id}/ready
pub async fn mark_ready(
    State(master): State<Master>,
    ctx: RequestContext,
    Path(allocation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    let allocation_id = parse_allocation_id(&allocation_id, &request_id)?;
    let state = master
        .mark_ready(allocation_id)
        .await
        .map_err(problem(&request_id))?;
    Ok(accepted(allocation_id, state))
}

/// POST /v1/allocations/{allocation_id}/waiting
pub async fn mark_waiting(
    State(master): State<Master>,
    ctx: RequestContext,
    Path(allocation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    let allocation_id = parse_allocation_id(&allocation_id, &request_id)?;
    let state = master
        .mark_waiting(allocation_id)
        .await
        .map_err(problem(&request_id))?;
    Ok(accepted(allocation_id, state))
}

/// POST /v1/allocations/{allocation_id}/cancel
pub async fn cancel(
    State(master): State<Master>,
    ctx: RequestContext,
    Path(allocation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    let allocation_id = parse_allocation_id(&allocation_id, &request_id)?;
    let state = master
        .cancel(allocation_id)
        .await
        .map_err(problem(&request_id))?;

    tracing::info!(request_id = %request_id, %allocation_id, state = %state, "Allocation cancel requested");
    Ok(accepted(allocation_id, Some(state)))
}

fn accepted(
    allocation_id: AllocationId,
    state: Option<AllocationState>,
) -> (StatusCode, Json<SignalResponse>) {
    (
        StatusCode::ACCEPTED,
        Json(SignalResponse {
            allocation_id,
            accepted: state.is_some(),
            state,
        }),
    )
}
