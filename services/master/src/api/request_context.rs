//! Request-scoped context extracted from HTTP requests.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use gantry_id::RequestId;

use crate::api::error::ApiError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Identifies who submits work, for fair-share accounting.
pub const REQUESTER_HEADER: &str = "x-gantry-requester";

const MAX_REQUESTER_LEN: usize = 128;

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub requester: Option<String>,
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = header_string(&parts.headers, REQUEST_ID_HEADER)
            .unwrap_or_else(|| RequestId::new().to_string());

        let requester = header_string(&parts.headers, REQUESTER_HEADER);
        if let Some(requester) = &requester {
            if requester.len() > MAX_REQUESTER_LEN {
                return Err(ApiError::bad_request(
                    "invalid_requester",
                    format!("{REQUESTER_HEADER} must be at most {MAX_REQUESTER_LEN} bytes"),
                )
                .with_request_id(request_id));
            }
        }

        Ok(Self {
            request_id,
            requester,
        })
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Request;

    use super::*;

    async fn extract(request: Request<()>) -> Result<RequestContext, ApiError> {
        let (mut parts, _) = request.into_parts();
        RequestContext::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_request_id_taken_from_header() {
        let request = Request::builder()
            .header(REQUEST_ID_HEADER, "req_custom")
            .header(REQUESTER_HEADER, "team-a")
            .body(())
            .unwrap();
        let ctx = extract(request).await.unwrap();
        assert_eq!(ctx.request_id, "req_custom");
        assert_eq!(ctx.requester.as_deref(), Some("team-a"));
    }

    #[tokio::test]
    async fn test_request_id_generated_when_absent() {
        let ctx = extract(Request::builder().body(()).unwrap()).await.unwrap();
        assert!(ctx.request_id.starts_with("req_"));
        assert!(ctx.requester.is_none());
    }

    #[tokio::test]
    async fn test_oversized_requester_rejected() {
        let request = Request::builder()
            .header(REQUESTER_HEADER, "x".repeat(MAX_REQUESTER_LEN + 1))
            .body(())
            .unwrap();
        let error = extract(request).await.unwrap_err();
        assert_eq!(error.status, axum::http::StatusCode::BAD_REQUEST);
    }
}
