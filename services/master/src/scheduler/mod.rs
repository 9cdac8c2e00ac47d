//! Scheduling policies.
//!
//! A policy is a pure function from a pass input (pending requests, running
//! allocations, and a registry snapshot) to a decision: which requests get
//! which slots, and which allocations must be preempted. Policies never
//! touch the registry; the master applies their decisions.

mod fair_share;
mod placement;
mod priority;
pub mod worker;

use chrono::{DateTime, Utc};
use gantry_events::AllocationState;
use gantry_id::{AllocationId, SlotId};
use serde::Serialize;

use crate::config::SchedulerConfig;
use crate::pool::TaskRequest;
use crate::registry::PoolSnapshot;

pub use fair_share::FairSharePolicy;
pub use placement::Capacity;
pub use priority::PriorityPolicy;
pub use worker::SchedulerWorker;

/// An allocation currently holding slots in the pool.
#[derive(Debug, Clone)]
pub struct RunningAllocation {
    pub allocation_id: AllocationId,
    pub requester: String,
    pub priority: i32,
    pub weight: f64,
    /// When the allocation was given its slots.
    pub started_at: DateTime<Utc>,
    pub state: AllocationState,
}

/// Everything a policy may look at during one pass.
#[derive(Debug, Clone, Copy)]
pub struct PassInput<'a> {
    pub now: DateTime<Utc>,
    /// Pending requests in arrival order.
    pub pending: &'a [TaskRequest],
    pub running: &'a [RunningAllocation],
    pub snapshot: &'a PoolSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placement {
    pub allocation_id: AllocationId,
    pub slots: Vec<SlotId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub placements: Vec<Placement>,
    pub preemptions: Vec<AllocationId>,
}

impl Decision {
    pub fn is_empty(&self) -> bool {
        self.placements.is_empty() && self.preemptions.is_empty()
    }
}

/// What one scheduling pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub placed: usize,
    pub preempted: usize,
    /// Placements the registry refused.
    pub failed_binds: usize,
    /// Queue length after the pass.
    pub pending: usize,
    /// The pool was held back and no pass ran.
    pub gated: bool,
}

impl PassReport {
    pub fn is_empty(&self) -> bool {
        self.placed == 0 && self.preempted == 0 && self.failed_binds == 0
    }
}

pub trait SchedulingPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn schedule(&self, input: &PassInput<'_>) -> Decision;
}

pub fn policy_for(config: &SchedulerConfig) -> Box<dyn SchedulingPolicy> {
    match config {
        SchedulerConfig::Priority { preemption, .. } => Box::new(PriorityPolicy::new(*preemption)),
        SchedulerConfig::FairShare { aging_per_sec } => {
            Box::new(FairSharePolicy::new(*aging_per_sec))
        }
    }
}
