//! Strict priority scheduling with optional preemption.

use std::cmp::Reverse;
use std::collections::BTreeSet;

use gantry_events::{Colocation, DeviceKind};
use gantry_id::{AgentId, AllocationId};
use tracing::debug;

use super::placement::Capacity;
use super::{Decision, PassInput, Placement, RunningAllocation, SchedulingPolicy};
use crate::pool::TaskRequest;

#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityPolicy {
    preemption: bool,
}

impl PriorityPolicy {
    pub fn new(preemption: bool) -> Self {
        Self { preemption }
    }
}

impl SchedulingPolicy for PriorityPolicy {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn schedule(&self, input: &PassInput<'_>) -> Decision {
        let mut capacity = Capacity::from_snapshot(input.snapshot);
        let mut decision = Decision::default();

        let mut order: Vec<&TaskRequest> = input.pending.iter().collect();
        order.sort_by_key(|r| (Reverse(r.priority), r.submitted_at, r.allocation_id));

        // Device families with a request that could not be placed. Later
        // requests of the same family must not jump ahead of it.
        let mut blocked: BTreeSet<DeviceKind> = BTreeSet::new();
        let mut victims: BTreeSet<AllocationId> = BTreeSet::new();

        for request in order {
            let family = request.resources.device.family();
            if blocked.contains(&family) {
                continue;
            }

            if let Some(slots) = capacity.find(&request.resources) {
                capacity.take(&slots);
                decision.placements.push(Placement {
                    allocation_id: request.allocation_id,
                    slots,
                });
                continue;
            }

            blocked.insert(family);
            if !self.preemption {
                continue;
            }

            match select_victims(request, &capacity, input.running, &victims) {
                Some(chosen) => {
                    debug!(
                        allocation_id = %request.allocation_id,
                        priority = request.priority,
                        victims = chosen.len(),
                        "preempting for blocked request"
                    );
                    for victim in chosen {
                        if victims.insert(victim) {
                            decision.preemptions.push(victim);
                        }
                    }
                }
                None => debug!(
                    allocation_id = %request.allocation_id,
                    "no lower-priority work to preempt"
                ),
            }
        }

        decision
    }
}

/// The smallest set of strictly lower-priority allocations whose release
/// lets `request` fit, lowest priority and most recently started first.
fn select_victims(
    request: &TaskRequest,
    capacity: &Capacity,
    running: &[RunningAllocation],
    taken: &BTreeSet<AllocationId>,
) -> Option<Vec<AllocationId>> {
    let spec = &request.resources;
    let mut candidates: Vec<&RunningAllocation> = running
        .iter()
        .filter(|r| r.priority < request.priority)
        .filter(|r| !taken.contains(&r.allocation_id))
        .filter(|r| capacity.holds_compatible(&r.allocation_id, &spec.device))
        .collect();
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by_key(|r| (r.priority, Reverse(r.started_at), r.allocation_id));

    // Capacity with the victims already chosen for earlier requests gone.
    let mut base = capacity.clone();
    for id in taken {
        base.release(id);
    }

    let fits = |victims: &[AllocationId], agent: Option<AgentId>| {
        let mut sim = base.clone();
        for victim in victims {
            sim.release(victim);
        }
        match agent {
            Some(agent) => sim.find_on(agent, spec).is_some(),
            None => sim.find(spec).is_some(),
        }
    };

    let grow_and_prune = |agent: Option<AgentId>| -> Option<Vec<AllocationId>> {
        let mut chosen = Vec::new();
        for candidate in &candidates {
            if let Some(agent) = agent {
                if !capacity.holds_on(&candidate.allocation_id, agent) {
                    continue;
                }
            }
            chosen.push(candidate.allocation_id);
            if fits(&chosen, agent) {
                break;
            }
        }
        if !fits(&chosen, agent) {
            return None;
        }
        // Drop any victim the request turns out not to need, most valuable first.
        let mut index = chosen.len();
        while index > 0 {
            index -= 1;
            let mut without = chosen.clone();
            without.remove(index);
            if fits(&without, agent) {
                chosen = without;
            }
        }
        Some(chosen)
    };

    match spec.colocation {
        Colocation::Spread => grow_and_prune(None),
        Colocation::SingleAgent => base
            .schedulable_agents()
            .filter_map(|agent| grow_and_prune(Some(agent)))
            .min_by_key(Vec::len),
    }
}
