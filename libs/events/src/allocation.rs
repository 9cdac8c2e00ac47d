//! Allocation lifecycle states and the typed events that move them.
//!
//! ```text
//! pending -> assigned -> starting -> waiting <-> running -> terminating(reason) -> terminated(outcome)
//!    |          |           |          |            |
//!    +----------+-----------+----------+------------+---> terminating(agent_lost | failed | ...)
//! ```
//!
//! A pending allocation that is cancelled goes straight to
//! `terminated(cancelled)`: it never held slots, so there is nothing to tear
//! down.

use gantry_id::{AgentId, SlotId};
use serde::{Deserialize, Serialize};

// =============================================================================
// States
// =============================================================================

/// Why an allocation is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminatingReason {
    Completed,
    Failed,
    Preempted,
    Cancelled,
    AgentLost,
}

impl std::fmt::Display for TerminatingReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TerminatingReason::Completed => "completed",
            TerminatingReason::Failed => "failed",
            TerminatingReason::Preempted => "preempted",
            TerminatingReason::Cancelled => "cancelled",
            TerminatingReason::AgentLost => "agent_lost",
        };
        f.write_str(s)
    }
}

/// Final outcome of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitOutcome {
    Success,
    Failed,
    Preempted,
    Cancelled,
    AgentLost,
}

impl From<TerminatingReason> for ExitOutcome {
    fn from(reason: TerminatingReason) -> Self {
        match reason {
            TerminatingReason::Completed => ExitOutcome::Success,
            TerminatingReason::Failed => ExitOutcome::Failed,
            TerminatingReason::Preempted => ExitOutcome::Preempted,
            TerminatingReason::Cancelled => ExitOutcome::Cancelled,
            TerminatingReason::AgentLost => ExitOutcome::AgentLost,
        }
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitOutcome::Success => "success",
            ExitOutcome::Failed => "failed",
            ExitOutcome::Preempted => "preempted",
            ExitOutcome::Cancelled => "cancelled",
            ExitOutcome::AgentLost => "agent_lost",
        };
        f.write_str(s)
    }
}

/// Allocation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AllocationState {
    /// Queued, no slots.
    Pending,
    /// Slots bound, start command sent.
    Assigned,
    /// Every agent acknowledged the start.
    Starting,
    /// The task reports it is waiting on an external condition.
    Waiting,
    /// The task reports readiness.
    Running,
    Terminating { reason: TerminatingReason },
    Terminated { outcome: ExitOutcome },
}

impl AllocationState {
    /// Position in the forward-only lifecycle. `Waiting` and `Running`
    /// share a rank so they may alternate.
    pub fn rank(&self) -> u8 {
        match self {
            AllocationState::Pending => 0,
            AllocationState::Assigned => 1,
            AllocationState::Starting => 2,
            AllocationState::Waiting | AllocationState::Running => 3,
            AllocationState::Terminating { .. } => 4,
            AllocationState::Terminated { .. } => 5,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AllocationState::Terminated { .. })
    }

    pub fn is_terminating(&self) -> bool {
        matches!(self, AllocationState::Terminating { .. })
    }

    /// States in which the allocation owns bound slots in the registry.
    pub fn holds_slots(&self) -> bool {
        matches!(
            self,
            AllocationState::Assigned
                | AllocationState::Starting
                | AllocationState::Waiting
                | AllocationState::Running
        )
    }

    /// Whether moving to `next` respects the forward-only transition table.
    pub fn can_transition_to(&self, next: &AllocationState) -> bool {
        use AllocationState::*;

        match (self, next) {
            (Terminated { .. }, _) => false,
            (Pending, Assigned) => true,
            (Pending, Terminated { outcome }) => *outcome == ExitOutcome::Cancelled,
            (Assigned, Starting) => true,
            (Starting | Waiting | Running, Waiting | Running) => self != next,
            (Terminating { .. }, Terminated { .. }) => true,
            (Terminating { .. }, Terminating { .. }) => false,
            (_, Terminating { .. }) => true,
            // Reattachment may find the allocation already gone.
            (_, Terminated { outcome }) => *outcome == ExitOutcome::AgentLost,
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AllocationState::Pending => "pending",
            AllocationState::Assigned => "assigned",
            AllocationState::Starting => "starting",
            AllocationState::Waiting => "waiting",
            AllocationState::Running => "running",
            AllocationState::Terminating { .. } => "terminating",
            AllocationState::Terminated { .. } => "terminated",
        }
    }
}

impl std::fmt::Display for AllocationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocationState::Terminating { reason } => write!(f, "terminating({reason})"),
            AllocationState::Terminated { outcome } => write!(f, "terminated({outcome})"),
            other => f.write_str(other.name()),
        }
    }
}

// =============================================================================
// Agent-facing enums
// =============================================================================

/// Connection and health status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    Connected,
    Disconnected,
    /// Connected, but its free slots are withheld from scheduling.
    Draining,
}

impl std::fmt::Display for AgentHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentHealth::Connected => "connected",
            AgentHealth::Disconnected => "disconnected",
            AgentHealth::Draining => "draining",
        };
        f.write_str(s)
    }
}

/// How an agent should stop an allocation's processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    Graceful,
    Force,
}

/// What an agent reports about an allocation it was asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveStatus {
    /// Process is up and ready.
    Running,
    /// Process is up and waiting on an external condition.
    Waiting,
    /// The agent has no such allocation.
    Gone,
}

// =============================================================================
// Typed Events
// =============================================================================

/// Decisions made by a pool's scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Assign { slots: Vec<SlotId> },
    Preempt,
}

/// Reports originating from (or about) agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    StartAcked {
        agent_id: AgentId,
    },
    StartFailed {
        agent_id: AgentId,
        message: String,
    },
    Exited {
        agent_id: AgentId,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    /// Agent stopped answering heartbeats or was deregistered.
    Lost {
        agent_id: AgentId,
    },
    /// Reattachment found the allocation alive on its agents.
    Reattached {
        status: LiveStatus,
    },
    /// Reattachment found the agent but not the allocation.
    Vanished,
    /// Reattachment could not reach the owning agents within the grace period.
    Unreachable,
}

/// Signals sent by the running task or its requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalEvent {
    Ready,
    Waiting,
    Cancel,
}

/// Deadlines armed by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerEvent {
    /// Start acknowledgment did not arrive in time.
    StartDeadline,
    /// Graceful stop did not complete within the grace period.
    StopGraceExpired,
    /// Forced stop was not confirmed either; give up waiting on the agent.
    ForceStopExpired,
}

/// Any event that can drive an allocation transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "event", rename_all = "snake_case")]
pub enum AllocationEvent {
    Scheduler(SchedulerEvent),
    Agent(AgentEvent),
    Signal(SignalEvent),
    Timer(TimerEvent),
}

impl AllocationEvent {
    /// Stable dotted name used as the history `cause`.
    pub fn event_type(&self) -> &'static str {
        use crate::event_types::*;

        match self {
            AllocationEvent::Scheduler(SchedulerEvent::Assign { .. }) => SCHEDULER_ASSIGN,
            AllocationEvent::Scheduler(SchedulerEvent::Preempt) => SCHEDULER_PREEMPT,
            AllocationEvent::Agent(AgentEvent::StartAcked { .. }) => AGENT_START_ACKED,
            AllocationEvent::Agent(AgentEvent::StartFailed { .. }) => AGENT_START_FAILED,
            AllocationEvent::Agent(AgentEvent::Exited { .. }) => AGENT_EXITED,
            AllocationEvent::Agent(AgentEvent::Lost { .. }) => AGENT_LOST,
            AllocationEvent::Agent(AgentEvent::Reattached { .. }) => AGENT_REATTACHED,
            AllocationEvent::Agent(AgentEvent::Vanished) => AGENT_VANISHED,
            AllocationEvent::Agent(AgentEvent::Unreachable) => AGENT_UNREACHABLE,
            AllocationEvent::Signal(SignalEvent::Ready) => SIGNAL_READY,
            AllocationEvent::Signal(SignalEvent::Waiting) => SIGNAL_WAITING,
            AllocationEvent::Signal(SignalEvent::Cancel) => SIGNAL_CANCEL,
            AllocationEvent::Timer(TimerEvent::StartDeadline) => TIMER_START_DEADLINE,
            AllocationEvent::Timer(TimerEvent::StopGraceExpired) => TIMER_STOP_GRACE_EXPIRED,
            AllocationEvent::Timer(TimerEvent::ForceStopExpired) => TIMER_FORCE_STOP_EXPIRED,
        }
    }
}

impl From<SchedulerEvent> for AllocationEvent {
    fn from(e: SchedulerEvent) -> Self {
        AllocationEvent::Scheduler(e)
    }
}

impl From<AgentEvent> for AllocationEvent {
    fn from(e: AgentEvent) -> Self {
        AllocationEvent::Agent(e)
    }
}

impl From<SignalEvent> for AllocationEvent {
    fn from(e: SignalEvent) -> Self {
        AllocationEvent::Signal(e)
    }
}

impl From<TimerEvent> for AllocationEvent {
    fn from(e: TimerEvent) -> Self {
        AllocationEvent::Timer(e)
    }
}
