//! Agent RPC over HTTP, against the URL each agent advertised at handshake.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gantry_events::{LiveStatus, StopMode};
use gantry_id::{AgentId, AllocationId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::{AgentRpc, RpcError, StartSpec};
use crate::registry::Registry;

#[derive(Debug, Serialize)]
struct StopRequest {
    mode: StopMode,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: LiveStatus,
}

pub struct HttpAgentRpc {
    client: reqwest::Client,
    registry: Arc<Registry>,
}

impl HttpAgentRpc {
    pub fn new(registry: Arc<Registry>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, registry })
    }

    fn url(&self, agent_id: &AgentId, path: &str) -> Result<String, RpcError> {
        let base = self
            .registry
            .rpc_url(agent_id)
            .ok_or_else(|| RpcError::Unreachable {
                agent_id: *agent_id,
                message: "agent has no rpc url".to_string(),
            })?;
        Ok(format!("{}{}", base.trim_end_matches('/'), path))
    }

    async fn check(
        agent_id: &AgentId,
        response: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<reqwest::Response, RpcError> {
        let response = response.map_err(|e| transport_error(agent_id, e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        error!(%agent_id, status = %status, body = %body, "Agent call failed");
        if status.is_client_error() {
            Err(RpcError::Rejected {
                agent_id: *agent_id,
                message: format!("{status}: {body}"),
            })
        } else {
            Err(RpcError::Unreachable {
                agent_id: *agent_id,
                message: format!("{status}: {body}"),
            })
        }
    }
}

fn transport_error(agent_id: &AgentId, e: reqwest::Error) -> RpcError {
    if e.is_timeout() {
        RpcError::Timeout(*agent_id)
    } else {
        RpcError::Unreachable {
            agent_id: *agent_id,
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl AgentRpc for HttpAgentRpc {
    async fn start(&self, agent_id: &AgentId, spec: &StartSpec) -> Result<(), RpcError> {
        let url = self.url(agent_id, &format!("/v1/allocations/{}/start", spec.allocation_id))?;
        debug!(%agent_id, allocation_id = %spec.allocation_id, "Sending start");

        let response = self.client.post(&url).json(spec).send().await;
        Self::check(agent_id, response).await?;
        Ok(())
    }

    async fn stop(
        &self,
        agent_id: &AgentId,
        allocation_id: AllocationId,
        mode: StopMode,
    ) -> Result<(), RpcError> {
        let url = self.url(agent_id, &format!("/v1/allocations/{allocation_id}/stop"))?;
        debug!(%agent_id, %allocation_id, ?mode, "Sending stop");

        let response = self
            .client
            .post(&url)
            .json(&StopRequest { mode })
            .send()
            .await;
        Self::check(agent_id, response).await?;
        Ok(())
    }

    async fn status(
        &self,
        agent_id: &AgentId,
        allocation_id: AllocationId,
    ) -> Result<LiveStatus, RpcError> {
        let url = self.url(agent_id, &format!("/v1/allocations/{allocation_id}/status"))?;

        let response = self.client.get(&url).send().await;
        // An agent that does not know the allocation answers 404.
        if let Ok(r) = &response {
            if r.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(LiveStatus::Gone);
            }
        }
        let response = Self::check(agent_id, response).await?;
        let body: StatusResponse = response
            .json()
            .await
            .map_err(|e| transport_error(agent_id, e))?;
        Ok(body.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_agent_is_unreachable() {
        let rpc = HttpAgentRpc::new(Arc::new(Registry::new()), Duration::from_secs(1)).unwrap();
        let agent_id = AgentId::new();
        let err = rpc.status(&agent_id, AllocationId::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::Unreachable { agent_id: a, .. } if a == agent_id));
    }

    #[test]
    fn test_stop_body_shape() {
        let body = serde_json::to_value(StopRequest {
            mode: StopMode::Force,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"mode": "force"}));
    }
}
