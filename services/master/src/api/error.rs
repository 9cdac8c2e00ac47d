//! RFC 7807 problem documents.

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::allocation::AllocationError;
use crate::error::MasterError;
use crate::logs::LogError;
use crate::pool::PoolError;
use crate::registry::RegistryError;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<FieldError>>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://gantry.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            request_id: "unknown".to_string(),
            retryable: false,
            details: None,
        }
    }

    fn set_request_id(&mut self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        self.request_id = request_id.clone();
        if self.instance.is_none() {
            self.instance = Some(request_id);
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn unprocessable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::UNPROCESSABLE_ENTITY, code, message)
    }

    pub fn payload_too_large(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::PAYLOAD_TOO_LARGE, code, message)
    }

    pub fn too_many_requests(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut error = Self::with_status(StatusCode::TOO_MANY_REQUESTS, code, message);
        error.problem.retryable = true;
        error
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.set_request_id(request_id);
        self
    }

    pub fn with_details(mut self, details: Vec<FieldError>) -> Self {
        self.problem.details = Some(details);
        self
    }
}

impl From<MasterError> for ApiError {
    fn from(error: MasterError) -> Self {
        let message = error.to_string();
        match error {
            MasterError::Pool(e) => match e {
                PoolError::UnknownPool(_) => Self::not_found("unknown_pool", message),
                PoolError::UnsatisfiableRequest(_) => {
                    Self::unprocessable("unsatisfiable_request", message)
                }
                PoolError::QueueFull { .. } => Self::too_many_requests("queue_full", message),
                PoolError::InvalidRequest(_) => Self::bad_request("invalid_request", message),
            },
            MasterError::Allocation(e) => match e {
                AllocationError::NotFound(_) => Self::not_found("unknown_allocation", message),
                AllocationError::InvalidTransition { .. } => {
                    Self::conflict("invalid_transition", message)
                }
                AllocationError::BindRejected { .. } => Self::conflict("capacity_conflict", message),
                AllocationError::Store(_) => Self::internal("store_error", message),
            },
            MasterError::Registry(e) => match e {
                RegistryError::CapacityConflict { .. } => {
                    Self::conflict("capacity_conflict", message)
                }
                RegistryError::UnknownAgent(_) => Self::not_found("unknown_agent", message),
                RegistryError::UnknownSlot(_) => Self::not_found("unknown_slot", message),
            },
            MasterError::Logs(e) => match e {
                LogError::UnknownAllocation(_) => Self::not_found("unknown_allocation", message),
                LogError::BatchTooLarge { .. } => Self::payload_too_large("batch_too_large", message),
                LogError::Store(_) => Self::internal("store_error", message),
            },
            MasterError::Store(_) => Self::internal("store_error", message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use gantry_id::AllocationId;

    use super::*;

    #[test]
    fn test_queue_full_is_retryable() {
        let error: ApiError = MasterError::from(PoolError::QueueFull {
            pool: "compute".to_string(),
            max_pending: 2,
        })
        .into();
        assert_eq!(error.status, StatusCode::TOO_MANY_REQUESTS);
        assert!(error.problem.retryable);
        assert_eq!(error.problem.code, "queue_full");
    }

    #[test]
    fn test_unknown_allocation_maps_to_not_found() {
        let error: ApiError =
            MasterError::from(LogError::UnknownAllocation(AllocationId::new())).into();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
        assert_eq!(error.problem.r#type, "https://gantry.dev/problems/unknown_allocation");
    }

    #[test]
    fn test_request_id_fills_instance() {
        let error = ApiError::bad_request("invalid_request", "nope").with_request_id("req_1");
        assert_eq!(error.problem.request_id, "req_1");
        assert_eq!(error.problem.instance.as_deref(), Some("req_1"));
    }

    #[test]
    fn test_response_uses_problem_content_type() {
        let response = ApiError::internal("boom", "broken").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }
}
