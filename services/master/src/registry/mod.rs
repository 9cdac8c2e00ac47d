//! Slot and agent registry.
//!
//! The authoritative in-memory view of connected agents, their device slots,
//! and which slots are bound to which allocation. Pure bookkeeping: no
//! scheduling policy lives here.
//!
//! Every mutation happens under one write lock, so a [`PoolSnapshot`] never
//! observes half of a bind. Each bind, unbind, or health change is announced
//! on a broadcast channel so pool workers can run a pass.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use gantry_events::{AgentHealth, DeviceKind};
use gantry_id::{AgentId, AllocationId, SlotId};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Capacity of the registry event channel.
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Attempted bind onto a slot owned by another allocation.
    #[error("capacity conflict: slot {slot} is bound to {holder}")]
    CapacityConflict { slot: SlotId, holder: AllocationId },

    #[error("unknown agent: {0}")]
    UnknownAgent(AgentId),

    #[error("unknown slot: {0}")]
    UnknownSlot(SlotId),
}

/// Agent handshake contents.
#[derive(Debug, Clone)]
pub struct AgentRegistration {
    pub agent_id: AgentId,
    pub pool: String,
    pub labels: BTreeMap<String, String>,
    pub rpc_url: Option<String>,
    /// Ordered slot list; a slot's index is its position here.
    pub slots: Vec<DeviceKind>,
}

/// Result of a registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterOutcome {
    /// The agent was already known.
    pub reconnected: bool,
    /// Allocations whose slots disappeared from the agent's new slot list.
    pub released: Vec<AllocationId>,
}

/// Change notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    AgentAdded {
        agent_id: AgentId,
        pool: String,
    },
    AgentRemoved {
        agent_id: AgentId,
        pool: String,
        affected: Vec<AllocationId>,
    },
    HealthChanged {
        agent_id: AgentId,
        pool: String,
        health: AgentHealth,
    },
    Bound {
        allocation_id: AllocationId,
        pools: Vec<String>,
    },
    Unbound {
        allocation_id: AllocationId,
        pools: Vec<String>,
    },
}

impl RegistryEvent {
    /// Pools whose capacity the event touches.
    pub fn pools(&self) -> Vec<&str> {
        match self {
            RegistryEvent::AgentAdded { pool, .. }
            | RegistryEvent::AgentRemoved { pool, .. }
            | RegistryEvent::HealthChanged { pool, .. } => vec![pool.as_str()],
            RegistryEvent::Bound { pools, .. } | RegistryEvent::Unbound { pools, .. } => {
                pools.iter().map(String::as_str).collect()
            }
        }
    }
}

// =============================================================================
// Views
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotView {
    pub id: SlotId,
    pub device: DeviceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound_to: Option<AllocationId>,
}

impl SlotView {
    pub fn is_free(&self) -> bool {
        self.bound_to.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentView {
    pub id: AgentId,
    pub pool: String,
    pub health: AgentHealth,
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_url: Option<String>,
    pub slots: Vec<SlotView>,
    pub registered_at: DateTime<Utc>,
}

impl AgentView {
    /// Free slots may be offered to the scheduler.
    pub fn is_schedulable(&self) -> bool {
        self.health == AgentHealth::Connected
    }

    pub fn free_slots(&self) -> impl Iterator<Item = &SlotView> {
        self.slots.iter().filter(|s| s.is_free())
    }
}

/// Immutable point-in-time view of one pool's agents.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub pool: String,
    /// Registry version the snapshot was taken at.
    pub version: u64,
    pub agents: Vec<AgentView>,
}

impl PoolSnapshot {
    /// Bound slots per allocation.
    pub fn bound_by_allocation(&self) -> HashMap<AllocationId, Vec<SlotId>> {
        let mut bound: HashMap<AllocationId, Vec<SlotId>> = HashMap::new();
        for agent in &self.agents {
            for slot in &agent.slots {
                if let Some(allocation) = slot.bound_to {
                    bound.entry(allocation).or_default().push(slot.id);
                }
            }
        }
        bound
    }

    /// Free slot counts by device kind, on schedulable agents only.
    pub fn free_by_kind(&self) -> BTreeMap<DeviceKind, usize> {
        let mut counts = BTreeMap::new();
        for agent in self.agents.iter().filter(|a| a.is_schedulable()) {
            for slot in agent.free_slots() {
                *counts.entry(slot.device.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn bound_by_kind(&self) -> BTreeMap<DeviceKind, usize> {
        let mut counts = BTreeMap::new();
        for agent in &self.agents {
            for slot in agent.slots.iter().filter(|s| !s.is_free()) {
                *counts.entry(slot.device.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Slots on agents that are still reachable.
    pub fn total_slots(&self) -> usize {
        self.agents
            .iter()
            .filter(|a| a.health != AgentHealth::Disconnected)
            .map(|a| a.slots.len())
            .sum()
    }
}

// =============================================================================
// Registry
// =============================================================================

struct SlotEntry {
    device: DeviceKind,
    bound: Option<AllocationId>,
}

struct AgentEntry {
    pool: String,
    labels: BTreeMap<String, String>,
    rpc_url: Option<String>,
    slots: Vec<SlotEntry>,
    health: AgentHealth,
    last_heartbeat: Instant,
    registered_at: DateTime<Utc>,
}

impl AgentEntry {
    fn view(&self, id: AgentId) -> AgentView {
        AgentView {
            id,
            pool: self.pool.clone(),
            health: self.health,
            labels: self.labels.clone(),
            rpc_url: self.rpc_url.clone(),
            slots: self
                .slots
                .iter()
                .enumerate()
                .map(|(index, slot)| SlotView {
                    id: SlotId::new(id, index as u32),
                    device: slot.device.clone(),
                    bound_to: slot.bound,
                })
                .collect(),
            registered_at: self.registered_at,
        }
    }

    fn allocations(&self) -> Vec<AllocationId> {
        let set: BTreeSet<_> = self.slots.iter().filter_map(|s| s.bound).collect();
        set.into_iter().collect()
    }
}

#[derive(Default)]
struct Inner {
    agents: BTreeMap<AgentId, AgentEntry>,
    bindings: HashMap<AllocationId, BTreeSet<SlotId>>,
    version: u64,
}

impl Inner {
    fn pools_of(&self, slots: &BTreeSet<SlotId>) -> Vec<String> {
        let pools: BTreeSet<_> = slots
            .iter()
            .filter_map(|s| self.agents.get(&s.agent))
            .map(|a| a.pool.clone())
            .collect();
        pools.into_iter().collect()
    }

    fn drop_binding(&mut self, slot: SlotId, allocation: AllocationId) {
        if let Some(set) = self.bindings.get_mut(&allocation) {
            set.remove(&slot);
            if set.is_empty() {
                self.bindings.remove(&allocation);
            }
        }
    }
}

pub struct Registry {
    inner: RwLock<Inner>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Monotonic mutation counter.
    pub fn version(&self) -> u64 {
        self.read().version
    }

    /// Add an agent, or refresh it on reconnect.
    ///
    /// On reconnect, bindings survive for slots that keep their index and
    /// device kind; bindings on slots that vanished are released.
    pub fn register(&self, registration: AgentRegistration) -> RegisterOutcome {
        let AgentRegistration {
            agent_id,
            pool,
            labels,
            rpc_url,
            slots,
        } = registration;

        let mut outcome = RegisterOutcome::default();
        let mut released_slots = BTreeSet::new();
        {
            let mut inner = self.write();

            let mut new_slots: Vec<SlotEntry> = slots
                .into_iter()
                .map(|device| SlotEntry {
                    device,
                    bound: None,
                })
                .collect();

            let registered_at = match inner.agents.remove(&agent_id) {
                Some(previous) => {
                    outcome.reconnected = true;
                    for (index, old) in previous.slots.into_iter().enumerate() {
                        let Some(holder) = old.bound else { continue };
                        match new_slots.get_mut(index) {
                            Some(slot) if slot.device == old.device => slot.bound = Some(holder),
                            _ => {
                                released_slots.insert((SlotId::new(agent_id, index as u32), holder));
                            }
                        }
                    }
                    previous.registered_at
                }
                None => Utc::now(),
            };

            for (slot, holder) in &released_slots {
                inner.drop_binding(*slot, *holder);
            }

            inner.agents.insert(
                agent_id,
                AgentEntry {
                    pool: pool.clone(),
                    labels,
                    rpc_url,
                    slots: new_slots,
                    health: AgentHealth::Connected,
                    last_heartbeat: Instant::now(),
                    registered_at,
                },
            );
            inner.version += 1;
        }

        let released: BTreeSet<_> = released_slots.iter().map(|(_, a)| *a).collect();
        outcome.released = released.into_iter().collect();

        info!(
            agent_id = %agent_id,
            pool = %pool,
            reconnected = outcome.reconnected,
            "Agent registered"
        );
        self.emit(RegistryEvent::AgentAdded { agent_id, pool });
        outcome
    }

    /// Remove an agent, force-releasing every slot it held.
    ///
    /// Returns the allocations that lost slots.
    pub fn deregister(&self, agent_id: &AgentId) -> Result<Vec<AllocationId>, RegistryError> {
        let (pool, affected) = {
            let mut inner = self.write();
            let entry = inner
                .agents
                .remove(agent_id)
                .ok_or(RegistryError::UnknownAgent(*agent_id))?;

            let affected = entry.allocations();
            for (index, slot) in entry.slots.iter().enumerate() {
                if let Some(holder) = slot.bound {
                    inner.drop_binding(SlotId::new(*agent_id, index as u32), holder);
                }
            }
            inner.version += 1;
            (entry.pool, affected)
        };

        info!(
            agent_id = %agent_id,
            pool = %pool,
            affected = affected.len(),
            "Agent deregistered"
        );
        self.emit(RegistryEvent::AgentRemoved {
            agent_id: *agent_id,
            pool,
            affected: affected.clone(),
        });
        Ok(affected)
    }

    /// Record a heartbeat. A disconnected agent becomes connected again.
    pub fn heartbeat(&self, agent_id: &AgentId) -> Result<(), RegistryError> {
        let revived = {
            let mut inner = self.write();
            let entry = inner
                .agents
                .get_mut(agent_id)
                .ok_or(RegistryError::UnknownAgent(*agent_id))?;
            entry.last_heartbeat = Instant::now();
            if entry.health == AgentHealth::Disconnected {
                entry.health = AgentHealth::Connected;
                let pool = entry.pool.clone();
                inner.version += 1;
                Some(pool)
            } else {
                None
            }
        };

        if let Some(pool) = revived {
            info!(agent_id = %agent_id, "Agent reconnected by heartbeat");
            self.emit(RegistryEvent::HealthChanged {
                agent_id: *agent_id,
                pool,
                health: AgentHealth::Connected,
            });
        }
        Ok(())
    }

    /// Stop offering an agent's free slots. Running work is unaffected.
    pub fn drain(&self, agent_id: &AgentId) -> Result<(), RegistryError> {
        self.set_health(agent_id, AgentHealth::Draining).map(|_| ())
    }

    /// Change an agent's health; returns the allocations bound on it.
    pub fn set_health(
        &self,
        agent_id: &AgentId,
        health: AgentHealth,
    ) -> Result<Vec<AllocationId>, RegistryError> {
        let (changed, pool, affected) = {
            let mut inner = self.write();
            let entry = inner
                .agents
                .get_mut(agent_id)
                .ok_or(RegistryError::UnknownAgent(*agent_id))?;
            let changed = entry.health != health;
            entry.health = health;
            let result = (changed, entry.pool.clone(), entry.allocations());
            if changed {
                inner.version += 1;
            }
            result
        };

        if changed {
            info!(agent_id = %agent_id, health = %health, "Agent health changed");
            self.emit(RegistryEvent::HealthChanged {
                agent_id: *agent_id,
                pool,
                health,
            });
        }
        Ok(affected)
    }

    /// Mark agents silent for longer than `timeout` as disconnected.
    ///
    /// Returns each newly disconnected agent with the allocations bound on it.
    pub fn expire_heartbeats(&self, timeout: Duration) -> Vec<(AgentId, Vec<AllocationId>)> {
        let now = Instant::now();
        let stale: Vec<AgentId> = self
            .read()
            .agents
            .iter()
            .filter(|(_, a)| a.health != AgentHealth::Disconnected)
            .filter(|(_, a)| now.duration_since(a.last_heartbeat) > timeout)
            .map(|(id, _)| *id)
            .collect();

        let mut expired = Vec::new();
        for agent_id in stale {
            match self.set_health(&agent_id, AgentHealth::Disconnected) {
                Ok(affected) => {
                    warn!(
                        agent_id = %agent_id,
                        affected = affected.len(),
                        "Agent missed heartbeat deadline"
                    );
                    expired.push((agent_id, affected));
                }
                Err(e) => debug!(agent_id = %agent_id, error = %e, "Agent vanished during sweep"),
            }
        }
        expired
    }

    /// Bind slots to an allocation, all or nothing.
    ///
    /// Rebinding slots an allocation already owns is a no-op.
    pub fn bind(&self, slots: &[SlotId], allocation: AllocationId) -> Result<(), RegistryError> {
        let pools = {
            let mut inner = self.write();

            for slot in slots {
                let agent = inner
                    .agents
                    .get(&slot.agent)
                    .ok_or(RegistryError::UnknownAgent(slot.agent))?;
                let entry = agent
                    .slots
                    .get(slot.index as usize)
                    .ok_or(RegistryError::UnknownSlot(*slot))?;
                if let Some(holder) = entry.bound {
                    if holder != allocation {
                        error!(
                            slot = %slot,
                            holder = %holder,
                            allocation_id = %allocation,
                            invariant_violation = true,
                            "Bind onto an already-bound slot"
                        );
                        return Err(RegistryError::CapacityConflict {
                            slot: *slot,
                            holder,
                        });
                    }
                }
            }

            let mut added = BTreeSet::new();
            for slot in slots {
                if let Some(entry) = inner
                    .agents
                    .get_mut(&slot.agent)
                    .and_then(|a| a.slots.get_mut(slot.index as usize))
                {
                    if entry.bound.is_none() {
                        entry.bound = Some(allocation);
                        added.insert(*slot);
                    }
                }
            }

            if added.is_empty() {
                return Ok(());
            }

            let pools = inner.pools_of(&added);
            inner
                .bindings
                .entry(allocation)
                .or_default()
                .extend(added.iter().copied());
            inner.version += 1;
            pools
        };

        debug!(allocation_id = %allocation, slots = slots.len(), "Slots bound");
        self.emit(RegistryEvent::Bound {
            allocation_id: allocation,
            pools,
        });
        Ok(())
    }

    /// Release every slot of an allocation. Idempotent.
    pub fn unbind(&self, allocation: AllocationId) -> Vec<SlotId> {
        let (released, pools) = {
            let mut inner = self.write();
            let Some(slots) = inner.bindings.remove(&allocation) else {
                return Vec::new();
            };

            for slot in &slots {
                if let Some(entry) = inner
                    .agents
                    .get_mut(&slot.agent)
                    .and_then(|a| a.slots.get_mut(slot.index as usize))
                {
                    if entry.bound == Some(allocation) {
                        entry.bound = None;
                    }
                }
            }
            let pools = inner.pools_of(&slots);
            inner.version += 1;
            (slots.into_iter().collect::<Vec<_>>(), pools)
        };

        debug!(allocation_id = %allocation, slots = released.len(), "Slots released");
        self.emit(RegistryEvent::Unbound {
            allocation_id: allocation,
            pools,
        });
        released
    }

    /// Consistent view of one pool.
    pub fn snapshot(&self, pool: &str) -> PoolSnapshot {
        let inner = self.read();
        PoolSnapshot {
            pool: pool.to_string(),
            version: inner.version,
            agents: inner
                .agents
                .iter()
                .filter(|(_, a)| a.pool == pool)
                .map(|(id, a)| a.view(*id))
                .collect(),
        }
    }

    pub fn agents(&self) -> Vec<AgentView> {
        self.read()
            .agents
            .iter()
            .map(|(id, a)| a.view(*id))
            .collect()
    }

    pub fn agent(&self, agent_id: &AgentId) -> Option<AgentView> {
        self.read().agents.get(agent_id).map(|a| a.view(*agent_id))
    }

    pub fn health(&self, agent_id: &AgentId) -> Option<AgentHealth> {
        self.read().agents.get(agent_id).map(|a| a.health)
    }

    pub fn rpc_url(&self, agent_id: &AgentId) -> Option<String> {
        self.read()
            .agents
            .get(agent_id)
            .and_then(|a| a.rpc_url.clone())
    }

    pub fn slots_of(&self, allocation: &AllocationId) -> Vec<SlotId> {
        self.read()
            .bindings
            .get(allocation)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn allocations_on(&self, agent_id: &AgentId) -> Vec<AllocationId> {
        self.read()
            .agents
            .get(agent_id)
            .map(AgentEntry::allocations)
            .unwrap_or_default()
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
