//! History envelope - one entry per allocation transition.

use chrono::{DateTime, Utc};
use gantry_id::{AllocationId, Seq};
use serde::{Deserialize, Serialize};

use crate::AllocationState;

/// Names used as the `cause` of a history entry.
pub mod event_types {
    pub const ALLOCATION_SUBMITTED: &str = "allocation.submitted";

    pub const SCHEDULER_ASSIGN: &str = "scheduler.assign";
    pub const SCHEDULER_PREEMPT: &str = "scheduler.preempt";

    pub const AGENT_START_ACKED: &str = "agent.start_acked";
    pub const AGENT_START_FAILED: &str = "agent.start_failed";
    pub const AGENT_EXITED: &str = "agent.exited";
    pub const AGENT_LOST: &str = "agent.lost";
    pub const AGENT_REATTACHED: &str = "agent.reattached";
    pub const AGENT_VANISHED: &str = "agent.vanished";
    pub const AGENT_UNREACHABLE: &str = "agent.unreachable";

    pub const SIGNAL_READY: &str = "signal.ready";
    pub const SIGNAL_WAITING: &str = "signal.waiting";
    pub const SIGNAL_CANCEL: &str = "signal.cancel";

    pub const TIMER_START_DEADLINE: &str = "timer.start_deadline";
    pub const TIMER_STOP_GRACE_EXPIRED: &str = "timer.stop_grace_expired";
    pub const TIMER_FORCE_STOP_EXPIRED: &str = "timer.force_stop_expired";

    /// Completion that follows directly from an earlier transition, e.g.
    /// `terminating(completed)` immediately settling into `terminated`.
    pub const CONTROLLER_SETTLED: &str = "controller.settled";

    /// The registry rejected a bind.
    pub const REGISTRY_CONFLICT: &str = "registry.capacity_conflict";
}

/// A single recorded transition of one allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationEventEnvelope {
    pub allocation_id: AllocationId,

    /// Strictly increasing per allocation, starting at 1.
    pub seq: Seq,

    pub occurred_at: DateTime<Utc>,

    /// `None` only for the submission entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<AllocationState>,

    pub to: AllocationState,

    /// What caused the transition (see [`event_types`]).
    pub cause: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AllocationEventEnvelope {
    /// Starts a history with the submission entry.
    pub fn submitted(allocation_id: AllocationId, occurred_at: DateTime<Utc>) -> Self {
        Self {
            allocation_id,
            seq: Seq::FIRST,
            occurred_at,
            from: None,
            to: AllocationState::Pending,
            cause: event_types::ALLOCATION_SUBMITTED.to_string(),
            detail: None,
        }
    }

    /// Builds the entry that follows `self`.
    pub fn follow(
        &self,
        to: AllocationState,
        cause: impl Into<String>,
        detail: Option<String>,
    ) -> Self {
        Self {
            allocation_id: self.allocation_id,
            seq: self.seq.next(),
            occurred_at: Utc::now(),
            from: Some(self.to),
            to,
            cause: cause.into(),
            detail,
        }
    }
}
