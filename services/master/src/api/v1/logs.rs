//! Log ingestion, queries, and follow streams.

use std::{convert::Infallible, str::FromStr, time::Duration};

use axum::{
    extract::{Path, Query, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use gantry_events::{LogEntry, LogFields, LogRecord};
use gantry_id::{AllocationId, Seq};
use serde::{Deserialize, Serialize};

use super::{parse_allocation_id, problem};
use crate::api::error::{ApiError, FieldError};
use crate::api::request_context::RequestContext;
use crate::logs::{LogFilter, LogQuery, SortOrder, MAX_LIMIT};
use crate::master::Master;

/// Query parameters shared by log queries and follow streams. List-valued
/// filters take comma-separated values.
#[derive(Debug, Default, Deserialize)]
pub struct QueryLogsParams {
    /// RFC 3339 timestamp (inclusive).
    pub since: Option<String>,
    /// RFC 3339 timestamp (inclusive).
    pub until: Option<String>,
    pub agent_id: Option<String>,
    pub container_id: Option<String>,
    pub rank: Option<String>,
    pub source: Option<String>,
    pub stdtype: Option<String>,
    pub level: Option<String>,
    /// Substring of the message.
    pub search: Option<String>,
    pub order: Option<SortOrder>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl QueryLogsParams {
    fn into_query(self) -> Result<LogQuery, Vec<FieldError>> {
        let mut errors = Vec::new();

        let filter = LogFilter {
            after: parse_time("since", self.since, &mut errors),
            before: parse_time("until", self.until, &mut errors),
            agent_ids: parse_list("agent_id", self.agent_id, &mut errors),
            container_ids: parse_list("container_id", self.container_id, &mut errors),
            ranks: parse_list("rank", self.rank, &mut errors),
            sources: parse_list("source", self.source, &mut errors),
            stdtypes: parse_list("stdtype", self.stdtype, &mut errors),
            levels: parse_list("level", self.level, &mut errors),
            search: self.search.filter(|s| !s.is_empty()),
        };

        if let Some(limit) = self.limit {
            if limit == 0 || limit > MAX_LIMIT {
                errors.push(FieldError {
                    field: "limit".to_string(),
                    message: format!("must be between 1 and {MAX_LIMIT}"),
                });
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(LogQuery {
            filter,
            order: self.order.unwrap_or_default(),
            limit: self.limit,
            offset: self.offset.unwrap_or(0),
        })
    }
}

fn parse_time(
    field: &str,
    raw: Option<String>,
    errors: &mut Vec<FieldError>,
) -> Option<DateTime<Utc>> {
    let raw = raw?;
    match DateTime::parse_from_rfc3339(&raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(_) => {
            errors.push(FieldError {
                field: field.to_string(),
                message: "expected an RFC 3339 timestamp".to_string(),
            });
            None
        }
    }
}

fn parse_list<T: FromStr>(
    field: &str,
    raw: Option<String>,
    errors: &mut Vec<FieldError>,
) -> Vec<T> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    let mut values = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.parse() {
            Ok(value) => values.push(value),
            Err(_) => errors.push(FieldError {
                field: field.to_string(),
                message: format!("invalid value '{part}'"),
            }),
        }
    }
    values
}

fn parse_params(params: QueryLogsParams, request_id: &str) -> Result<LogQuery, ApiError> {
    params.into_query().map_err(|details| {
        ApiError::bad_request("invalid_log_query", "Invalid log query parameters")
            .with_details(details)
            .with_request_id(request_id.to_string())
    })
}

/// Body of a log batch shipped by an agent.
#[derive(Debug, Deserialize)]
pub struct IngestLogsRequest {
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Serialize)]
pub struct IngestLogsResponse {
    pub accepted: usize,
    /// Sequence numbers assigned to the entries, in order.
    pub seqs: Vec<Seq>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub allocation_id: AllocationId,
    pub items: Vec<LogRecord>,
}

/// POST /v1/allocations/{allocation_id}/logs
pub async fn ingest_logs(
    State(master): State<Master>,
    ctx: RequestContext,
    Path(allocation_id): Path<String>,
    Json(req): Json<IngestLogsRequest>,
) -> Result<Json<IngestLogsResponse>, ApiError> {
    let request_id = ctx.request_id;
    let allocation_id = parse_allocation_id(&allocation_id, &request_id)?;

    let seqs = master
        .append_logs(allocation_id, req.entries)
        .map_err(problem(&request_id))?;

    tracing::debug!(
        request_id = %request_id,
        %allocation_id,
        accepted = seqs.len(),
        "Log batch ingested"
    );

    Ok(Json(IngestLogsResponse {
        accepted: seqs.len(),
        seqs,
    }))
}

/// GET /v1/allocations/{allocation_id}/logs
pub async fn query_logs(
    State(master): State<Master>,
    ctx: RequestContext,
    Path(allocation_id): Path<String>,
    Query(params): Query<QueryLogsParams>,
) -> Result<Json<LogsResponse>, ApiError> {
    let request_id = ctx.request_id;
    let allocation_id = parse_allocation_id(&allocation_id, &request_id)?;
    let query = parse_params(params, &request_id)?;

    let items = master
        .query_logs(allocation_id, &query)
        .map_err(problem(&request_id))?;

    Ok(Json(LogsResponse {
        allocation_id,
        items,
    }))
}

/// GET /v1/allocations/{allocation_id}/logs/fields
pub async fn log_fields(
    State(master): State<Master>,
    ctx: RequestContext,
    Path(allocation_id): Path<String>,
) -> Result<Json<LogFields>, ApiError> {
    let request_id = ctx.request_id;
    let allocation_id = parse_allocation_id(&allocation_id, &request_id)?;
    let fields = master
        .log_fields(allocation_id)
        .map_err(problem(&request_id))?;
    Ok(Json(fields))
}

/// Follow an allocation's logs (server-sent events).
///
/// Matching history comes first in ascending order, then new records as
/// they arrive. An `end` event marks the log stream closing.
///
/// GET /v1/allocations/{allocation_id}/logs/stream
pub async fn stream_logs(
    State(master): State<Master>,
    ctx: RequestContext,
    Path(allocation_id): Path<String>,
    Query(params): Query<QueryLogsParams>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id;
    let allocation_id = parse_allocation_id(&allocation_id, &request_id)?;
    let query = parse_params(params, &request_id)?;

    let records = master
        .follow_logs(allocation_id, &query)
        .map_err(problem(&request_id))?;

    tracing::info!(request_id = %request_id, %allocation_id, "Log stream opened");

    let events = records
        .map(|record| Ok::<_, Infallible>(record_event(&record)))
        .chain(stream::once(async {
            Ok::<_, Infallible>(Event::default().event("end").data("closed"))
        }));

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

fn record_event(record: &LogRecord) -> Event {
    match serde_json::to_string(record) {
        Ok(data) => Event::default()
            .event("log")
            .id(record.seq.to_string())
            .data(data),
        Err(e) => {
            tracing::error!(error = %e, seq = %record.seq, "Failed to serialize log record");
            Event::default().event("error").data("unserializable record")
        }
    }
}
