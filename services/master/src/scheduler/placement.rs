//! Slot selection against a working copy of pool capacity.

use std::cmp::Reverse;
use std::collections::HashMap;

use gantry_events::{Colocation, DeviceKind, ResourceSpec};
use gantry_id::{AgentId, AllocationId, SlotId};

use crate::registry::PoolSnapshot;

#[derive(Debug, Clone)]
struct AgentCapacity {
    id: AgentId,
    schedulable: bool,
    /// Free slots in index order.
    free: Vec<(SlotId, DeviceKind)>,
}

impl AgentCapacity {
    fn compatible(&self, want: &DeviceKind) -> usize {
        self.free.iter().filter(|(_, d)| d.satisfies(want)).count()
    }

    fn exact(&self, want: &DeviceKind) -> usize {
        self.free.iter().filter(|(_, d)| d.is_exact(want)).count()
    }

    /// Up to `n` compatible slots, exact matches first.
    fn pick(&self, want: &DeviceKind, n: usize) -> Vec<SlotId> {
        let exact = self.free.iter().filter(|(_, d)| d.is_exact(want));
        let other = self
            .free
            .iter()
            .filter(|(_, d)| d.satisfies(want) && !d.is_exact(want));
        exact.chain(other).take(n).map(|(id, _)| *id).collect()
    }
}

/// Free capacity of one pool, mutated as a pass hands out slots.
#[derive(Debug, Clone)]
pub struct Capacity {
    agents: Vec<AgentCapacity>,
    held: HashMap<AllocationId, Vec<(SlotId, DeviceKind)>>,
}

impl Capacity {
    /// Only connected agents offer their free slots.
    pub fn from_snapshot(snapshot: &PoolSnapshot) -> Self {
        let mut held: HashMap<AllocationId, Vec<(SlotId, DeviceKind)>> = HashMap::new();
        let agents = snapshot
            .agents
            .iter()
            .map(|agent| {
                let schedulable = agent.is_schedulable();
                let mut free = Vec::new();
                for slot in &agent.slots {
                    match slot.bound_to {
                        Some(allocation) => held
                            .entry(allocation)
                            .or_default()
                            .push((slot.id, slot.device.clone())),
                        None if schedulable => free.push((slot.id, slot.device.clone())),
                        None => {}
                    }
                }
                AgentCapacity {
                    id: agent.id,
                    schedulable,
                    free,
                }
            })
            .collect();
        Self { agents, held }
    }

    /// Free slots able to serve `want`.
    pub fn free_count(&self, want: &DeviceKind) -> usize {
        self.agents.iter().map(|a| a.compatible(want)).sum()
    }

    /// Slots currently held by `allocation`.
    pub fn held_by(&self, allocation: &AllocationId) -> usize {
        self.held.get(allocation).map_or(0, Vec::len)
    }

    /// Whether `allocation` holds any slot that could serve `want`.
    pub fn holds_compatible(&self, allocation: &AllocationId, want: &DeviceKind) -> bool {
        self.held
            .get(allocation)
            .is_some_and(|slots| slots.iter().any(|(_, d)| d.satisfies(want)))
    }

    /// Whether `allocation` holds slots on `agent`.
    pub fn holds_on(&self, allocation: &AllocationId, agent: AgentId) -> bool {
        self.held
            .get(allocation)
            .is_some_and(|slots| slots.iter().any(|(id, _)| id.agent == agent))
    }

    /// Agents currently offering slots.
    pub fn schedulable_agents(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.agents.iter().filter(|a| a.schedulable).map(|a| a.id)
    }

    /// Choose slots for `spec`, or `None` if free capacity cannot serve it.
    ///
    /// One agent is always preferred. Among agents that fit, those with
    /// enough exact-kind slots win, then those with the most free slots of
    /// a compatible kind.
    /// A spread request that fits nowhere whole takes slots from the
    /// agents with the most compatible capacity first.
    pub fn find(&self, spec: &ResourceSpec) -> Option<Vec<SlotId>> {
        if spec.slots == 0 {
            return None;
        }
        if let Some(slots) = self.find_single(spec, None) {
            return Some(slots);
        }
        match spec.colocation {
            Colocation::SingleAgent => None,
            Colocation::Spread => self.find_spread(spec),
        }
    }

    /// Like [`Capacity::find`], restricted to one agent.
    pub fn find_on(&self, agent: AgentId, spec: &ResourceSpec) -> Option<Vec<SlotId>> {
        if spec.slots == 0 {
            return None;
        }
        self.find_single(spec, Some(agent))
    }

    /// Mark slots as handed out.
    pub fn take(&mut self, slots: &[SlotId]) {
        for agent in &mut self.agents {
            agent.free.retain(|(id, _)| !slots.contains(id));
        }
    }

    /// Pretend `allocation` has released its slots.
    pub fn release(&mut self, allocation: &AllocationId) {
        let Some(slots) = self.held.remove(allocation) else {
            return;
        };
        for (slot, device) in slots {
            if let Some(agent) = self
                .agents
                .iter_mut()
                .find(|a| a.id == slot.agent && a.schedulable)
            {
                agent.free.push((slot, device));
                agent.free.sort_by_key(|(id, _)| id.index);
            }
        }
    }

    fn find_single(&self, spec: &ResourceSpec, only: Option<AgentId>) -> Option<Vec<SlotId>> {
        let want = spec.slots as usize;
        self.agents
            .iter()
            .filter(|a| a.schedulable && only.is_none_or(|id| id == a.id))
            .filter(|a| a.compatible(&spec.device) >= want)
            .min_by_key(|a| (a.exact(&spec.device) < want, Reverse(a.compatible(&spec.device))))
            .map(|a| a.pick(&spec.device, want))
    }

    fn find_spread(&self, spec: &ResourceSpec) -> Option<Vec<SlotId>> {
        let want = spec.slots as usize;
        if self.free_count(&spec.device) < want {
            return None;
        }

        let mut agents: Vec<&AgentCapacity> = self
            .agents
            .iter()
            .filter(|a| a.schedulable && a.compatible(&spec.device) > 0)
            .collect();
        agents.sort_by_key(|a| {
            (
                Reverse(a.compatible(&spec.device)),
                Reverse(a.exact(&spec.device)),
            )
        });

        let mut chosen = Vec::with_capacity(want);
        for agent in agents {
            let remaining = want - chosen.len();
            chosen.extend(agent.pick(&spec.device, remaining));
            if chosen.len() == want {
                return Some(chosen);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use gantry_events::AgentHealth;

    use super::*;
    use crate::scheduler::testing::{agent, gpus, occupy, snapshot};

    #[test]
    fn test_single_agent_prefers_most_free() {
        let small = gpus(2);
        let large = gpus(4);
        let large_id = large.id;
        let capacity = Capacity::from_snapshot(&snapshot(vec![small, large]));

        let slots = capacity.find(&ResourceSpec::gpus(2)).unwrap();
        assert_eq!(slots.len(), 2);
        assert!(slots.iter().all(|s| s.agent == large_id));
    }

    #[test]
    fn test_most_free_counts_only_compatible_slots() {
        let mut mixed_devices = vec![DeviceKind::Cpu; 6];
        mixed_devices.extend([DeviceKind::gpu(), DeviceKind::gpu()]);
        let mixed = agent(&mixed_devices);
        let gpu_heavy = gpus(3);
        let gpu_heavy_id = gpu_heavy.id;
        let capacity = Capacity::from_snapshot(&snapshot(vec![mixed, gpu_heavy]));

        let slots = capacity.find(&ResourceSpec::gpus(1)).unwrap();
        assert_eq!(slots[0].agent, gpu_heavy_id);
    }

    #[test]
    fn test_exact_kind_preferred() {
        let tagged = agent(&vec![DeviceKind::gpu_class("a100"); 4]);
        let plain = gpus(2);
        let plain_id = plain.id;
        let capacity = Capacity::from_snapshot(&snapshot(vec![tagged, plain]));

        // An untagged request fits both; the plain agent matches exactly.
        let slots = capacity.find(&ResourceSpec::gpus(2)).unwrap();
        assert!(slots.iter().all(|s| s.agent == plain_id));
    }

    #[test]
    fn test_single_agent_never_spans() {
        let capacity = Capacity::from_snapshot(&snapshot(vec![gpus(2), gpus(2)]));
        assert!(capacity.find(&ResourceSpec::gpus(3)).is_none());

        let spread = capacity.find(&ResourceSpec::gpus(3).spread()).unwrap();
        assert_eq!(spread.len(), 3);
        let agents: std::collections::BTreeSet<_> = spread.iter().map(|s| s.agent).collect();
        assert_eq!(agents.len(), 2);
    }

    #[test]
    fn test_spread_packs_when_possible() {
        let capacity = Capacity::from_snapshot(&snapshot(vec![gpus(1), gpus(3)]));
        let slots = capacity.find(&ResourceSpec::gpus(3).spread()).unwrap();
        let agents: std::collections::BTreeSet<_> = slots.iter().map(|s| s.agent).collect();
        assert_eq!(agents.len(), 1);
    }

    #[test]
    fn test_draining_and_bound_slots_are_not_offered() {
        let mut draining = gpus(4);
        draining.health = AgentHealth::Draining;
        let mut busy = gpus(2);
        occupy(&mut busy, 1, AllocationId::new());
        let capacity = Capacity::from_snapshot(&snapshot(vec![draining, busy]));

        assert_eq!(capacity.free_count(&DeviceKind::gpu()), 1);
        assert!(capacity.find(&ResourceSpec::gpus(2)).is_none());
    }

    #[test]
    fn test_take_and_release() {
        let mut node = gpus(2);
        let holder = AllocationId::new();
        occupy(&mut node, 2, holder);
        let mut capacity = Capacity::from_snapshot(&snapshot(vec![node]));
        assert!(capacity.find(&ResourceSpec::gpus(1)).is_none());
        assert_eq!(capacity.held_by(&holder), 2);

        capacity.release(&holder);
        let slots = capacity.find(&ResourceSpec::gpus(2)).unwrap();
        capacity.take(&slots);
        assert_eq!(capacity.free_count(&DeviceKind::gpu()), 0);
    }
}
