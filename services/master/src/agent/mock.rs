//! In-process agent RPC for development mode and tests.
//!
//! Every call is recorded. Starts and stops succeed unless the agent is
//! marked unreachable or rejecting; status answers come from a table and
//! default to [`LiveStatus::Gone`].

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use gantry_events::{LiveStatus, StopMode};
use gantry_id::{AgentId, AllocationId};

use super::{AgentRpc, RpcError, StartSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcCall {
    Start {
        agent_id: AgentId,
        allocation_id: AllocationId,
    },
    Stop {
        agent_id: AgentId,
        allocation_id: AllocationId,
        mode: StopMode,
    },
    Status {
        agent_id: AgentId,
        allocation_id: AllocationId,
    },
}

#[derive(Default)]
struct MockState {
    calls: Vec<RpcCall>,
    unreachable: BTreeSet<AgentId>,
    rejecting: BTreeSet<AgentId>,
    statuses: HashMap<(AgentId, AllocationId), LiveStatus>,
}

#[derive(Default)]
pub struct MockAgentRpc {
    state: Mutex<MockState>,
}

impl MockAgentRpc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, agent_id: AgentId, unreachable: bool) {
        let mut state = self.state();
        if unreachable {
            state.unreachable.insert(agent_id);
        } else {
            state.unreachable.remove(&agent_id);
        }
    }

    /// Make the agent refuse start commands.
    pub fn reject_starts(&self, agent_id: AgentId) {
        self.state().rejecting.insert(agent_id);
    }

    pub fn set_status(&self, agent_id: AgentId, allocation_id: AllocationId, status: LiveStatus) {
        self.state()
            .statuses
            .insert((agent_id, allocation_id), status);
    }

    pub fn calls(&self) -> Vec<RpcCall> {
        self.state().calls.clone()
    }

    pub fn starts(&self) -> Vec<(AgentId, AllocationId)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RpcCall::Start {
                    agent_id,
                    allocation_id,
                } => Some((agent_id, allocation_id)),
                _ => None,
            })
            .collect()
    }

    pub fn stops(&self) -> Vec<(AgentId, AllocationId, StopMode)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RpcCall::Stop {
                    agent_id,
                    allocation_id,
                    mode,
                } => Some((agent_id, allocation_id, mode)),
                _ => None,
            })
            .collect()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reachable(&self, state: &MockState, agent_id: &AgentId) -> Result<(), RpcError> {
        if state.unreachable.contains(agent_id) {
            return Err(RpcError::Unreachable {
                agent_id: *agent_id,
                message: "marked unreachable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AgentRpc for MockAgentRpc {
    async fn start(&self, agent_id: &AgentId, spec: &StartSpec) -> Result<(), RpcError> {
        let mut state = self.state();
        state.calls.push(RpcCall::Start {
            agent_id: *agent_id,
            allocation_id: spec.allocation_id,
        });
        self.reachable(&state, agent_id)?;
        if state.rejecting.contains(agent_id) {
            return Err(RpcError::Rejected {
                agent_id: *agent_id,
                message: "start refused".to_string(),
            });
        }
        state
            .statuses
            .insert((*agent_id, spec.allocation_id), LiveStatus::Running);
        Ok(())
    }

    async fn stop(
        &self,
        agent_id: &AgentId,
        allocation_id: AllocationId,
        mode: StopMode,
    ) -> Result<(), RpcError> {
        let mut state = self.state();
        state.calls.push(RpcCall::Stop {
            agent_id: *agent_id,
            allocation_id,
            mode,
        });
        self.reachable(&state, agent_id)?;
        state.statuses.remove(&(*agent_id, allocation_id));
        Ok(())
    }

    async fn status(
        &self,
        agent_id: &AgentId,
        allocation_id: AllocationId,
    ) -> Result<LiveStatus, RpcError> {
        let mut state = self.state();
        state.calls.push(RpcCall::Status {
            agent_id: *agent_id,
            allocation_id,
        });
        self.reachable(&state, agent_id)?;
        Ok(state
            .statuses
            .get(&(*agent_id, allocation_id))
            .copied()
            .unwrap_or(LiveStatus::Gone))
    }
}
