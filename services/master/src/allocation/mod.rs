//! Allocations: the runtime record of an admitted task request.
//!
//! [`machine`] holds the pure transition function, [`controller`] drives it
//! with registry, agent, and timer side effects, and [`reattach`] reconciles
//! persisted records against live agents after a restart.

pub mod controller;
pub mod machine;
pub mod reattach;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use gantry_events::{AllocationEventEnvelope, AllocationState, ExitOutcome};
use gantry_id::{AgentId, AllocationId, Seq, SlotId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::DbError;
use crate::pool::TaskRequest;
use crate::registry::RegistryError;

pub use controller::{AllocationController, ControllerEvent};
pub use machine::{Effect, Outcome};
pub use reattach::Reattacher;

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("allocation not found: {0}")]
    NotFound(AllocationId),

    #[error("invalid transition for {allocation_id}: {from} -> {to}")]
    InvalidTransition {
        allocation_id: AllocationId,
        from: AllocationState,
        to: AllocationState,
    },

    /// The registry refused the slots chosen for the allocation.
    #[error("bind rejected for {allocation_id}: {source}")]
    BindRejected {
        allocation_id: AllocationId,
        #[source]
        source: RegistryError,
    },

    #[error(transparent)]
    Store(#[from] DbError),
}

/// The controller's record of one allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub request: TaskRequest,
    pub state: AllocationState,
    /// Slots bound to this allocation. Advisory; the registry is authoritative.
    #[serde(default)]
    pub slots: Vec<SlotId>,
    /// Agents that acknowledged the start command.
    #[serde(default)]
    pub acked: BTreeSet<AgentId>,
    /// Agents whose processes are gone, with whether they succeeded.
    #[serde(default)]
    pub exits: BTreeMap<AgentId, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ExitOutcome>,
    /// Last failure message reported by an agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Sequence of the latest history entry.
    pub last_seq: Seq,
}

impl Allocation {
    /// A pending allocation whose history starts with its submission.
    pub fn new(request: TaskRequest) -> Self {
        Self {
            id: request.allocation_id,
            request,
            state: AllocationState::Pending,
            slots: Vec::new(),
            acked: BTreeSet::new(),
            exits: BTreeMap::new(),
            assigned_at: None,
            started_at: None,
            ready_at: None,
            ended_at: None,
            outcome: None,
            message: None,
            last_seq: Seq::FIRST,
        }
    }

    /// The history entry recording the submission.
    pub fn submission(&self) -> AllocationEventEnvelope {
        AllocationEventEnvelope::submitted(self.id, self.request.submitted_at)
    }

    /// Agents owning at least one of the allocation's slots.
    pub fn agents(&self) -> BTreeSet<AgentId> {
        self.slots.iter().map(|s| s.agent).collect()
    }

    /// Owning agents whose processes have not exited yet.
    pub fn remaining_agents(&self) -> Vec<AgentId> {
        self.agents()
            .into_iter()
            .filter(|a| !self.exits.contains_key(a))
            .collect()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn pool(&self) -> &str {
        &self.request.pool
    }
}

/// An allocation together with its full transition history.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationDetail {
    #[serde(flatten)]
    pub allocation: Allocation,
    pub history: Vec<AllocationEventEnvelope>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_allocation_is_pending() {
        let request = TaskRequest::builder("compute").gpus(2).build();
        let alloc = Allocation::new(request.clone());
        assert_eq!(alloc.id, request.allocation_id);
        assert_eq!(alloc.state, AllocationState::Pending);
        assert_eq!(alloc.last_seq, Seq::FIRST);
        assert_eq!(alloc.submission().seq, alloc.last_seq);
        assert!(alloc.agents().is_empty());
    }

    #[test]
    fn test_remaining_agents_skip_exited() {
        let mut alloc = Allocation::new(TaskRequest::builder("compute").gpus(2).spread().build());
        let (a, b) = (AgentId::new(), AgentId::new());
        alloc.slots = vec![SlotId::new(a, 0), SlotId::new(b, 0)];
        alloc.exits.insert(a, true);
        assert_eq!(alloc.remaining_agents(), vec![b]);
    }
}
