//! The allocation controller.
//!
//! Owns every live allocation record. Each record sits behind its own async
//! mutex, so transitions for one allocation are strictly sequential while
//! different allocations progress in parallel. A transition is computed on
//! a copy, persisted with its history entries, and only then committed and
//! acted upon.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;
use gantry_events::{
    event_types, AllocationEvent, AllocationEventEnvelope, AllocationState, SchedulerEvent,
    TimerEvent,
};
use gantry_id::AllocationId;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use super::machine::{self, Effect, Outcome};
use super::{Allocation, AllocationDetail, AllocationError};
use crate::agent::{AgentDispatcher, AgentRpc, StartSpec};
use crate::config::MasterSettings;
use crate::db::Store;
use crate::logs::LogAggregator;
use crate::pool::{ResourcePool, TaskRequest};
use crate::registry::{Registry, RegistryError};
use crate::scheduler::RunningAllocation;

/// Capacity of the controller's event inbox.
const INBOX_CAPACITY: usize = 1024;

/// An event addressed to one allocation, delivered through the inbox.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerEvent {
    pub allocation_id: AllocationId,
    pub event: AllocationEvent,
}

type Entry = Arc<tokio::sync::Mutex<Allocation>>;

#[derive(Clone)]
pub struct AllocationController {
    inner: Arc<Inner>,
}

struct Inner {
    store: Store,
    registry: Arc<Registry>,
    dispatcher: AgentDispatcher,
    logs: Arc<LogAggregator>,
    pools: Arc<BTreeMap<String, Arc<ResourcePool>>>,
    settings: MasterSettings,
    allocations: RwLock<HashMap<AllocationId, Entry>>,
    events: mpsc::Sender<ControllerEvent>,
    inbox: Mutex<Option<mpsc::Receiver<ControllerEvent>>>,
}

impl AllocationController {
    pub fn new(
        store: Store,
        registry: Arc<Registry>,
        rpc: Arc<dyn AgentRpc>,
        logs: Arc<LogAggregator>,
        pools: Arc<BTreeMap<String, Arc<ResourcePool>>>,
        settings: MasterSettings,
    ) -> Self {
        let (events, inbox) = mpsc::channel(INBOX_CAPACITY);
        let dispatcher = AgentDispatcher::new(
            rpc,
            events.clone(),
            settings.rpc_backoff.clone(),
            settings.rpc_max_attempts,
        );
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                dispatcher,
                logs,
                pools,
                settings,
                allocations: RwLock::new(HashMap::new()),
                events,
                inbox: Mutex::new(Some(inbox)),
            }),
        }
    }

    pub fn dispatcher(&self) -> &AgentDispatcher {
        &self.inner.dispatcher
    }

    /// Sender for events produced outside the controller.
    pub fn sender(&self) -> mpsc::Sender<ControllerEvent> {
        self.inner.events.clone()
    }

    /// Record a new pending allocation and its submission entry.
    pub fn create(&self, request: TaskRequest) -> Result<Allocation, AllocationError> {
        let allocation = Allocation::new(request);
        self.inner
            .store
            .record_transitions(&allocation, &[allocation.submission()])?;
        self.inner.logs.open(allocation.id);
        self.insert(allocation.clone());
        debug!(allocation_id = %allocation.id, pool = %allocation.pool(), "Allocation created");
        Ok(allocation)
    }

    /// Adopt a persisted, non-terminal allocation after a restart. A record
    /// already held in memory is kept.
    pub fn restore(&self, allocation: Allocation) {
        if allocation.is_terminal() {
            return;
        }
        self.inner
            .allocations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(allocation.id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(allocation)));
    }

    /// Apply one event to one allocation and carry out its effects.
    /// Returns the state after the event.
    pub async fn handle(
        &self,
        allocation_id: AllocationId,
        event: &AllocationEvent,
    ) -> Result<AllocationState, AllocationError> {
        let entry = self
            .entry(&allocation_id)
            .ok_or(AllocationError::NotFound(allocation_id))?;
        let mut current = entry.lock().await;
        let now = Utc::now();
        let mut next = current.clone();

        let mut bound = false;
        let outcome = match event {
            AllocationEvent::Scheduler(SchedulerEvent::Assign { slots })
                if next.state == AllocationState::Pending =>
            {
                match self.inner.registry.bind(slots, allocation_id) {
                    Ok(()) => {
                        bound = true;
                        machine::apply(&mut next, event, now)
                    }
                    Err(e @ RegistryError::CapacityConflict { .. }) => {
                        error!(
                            %allocation_id,
                            error = %e,
                            invariant_violation = true,
                            "Registry refused bind, failing allocation"
                        );
                        machine::force_fail(&mut next, event_types::REGISTRY_CONFLICT, e.to_string(), now)
                    }
                    Err(source) => {
                        return Err(AllocationError::BindRejected {
                            allocation_id,
                            source,
                        })
                    }
                }
            }
            _ => machine::apply(&mut next, event, now),
        };

        self.commit(&mut current, next, outcome, bound)
    }

    /// Tear an allocation down as failed, whatever its state.
    pub async fn force_fail(
        &self,
        allocation_id: AllocationId,
        cause: &str,
        detail: String,
    ) -> Result<AllocationState, AllocationError> {
        let entry = self
            .entry(&allocation_id)
            .ok_or(AllocationError::NotFound(allocation_id))?;
        let mut current = entry.lock().await;
        let mut next = current.clone();
        let outcome = machine::force_fail(&mut next, cause, detail, Utc::now());
        self.commit(&mut current, next, outcome, false)
    }

    /// Persist `next`, then make it current and run its effects.
    /// `bound` says whether slots were bound for this step and must be
    /// released if it is discarded.
    fn commit(
        &self,
        current: &mut Allocation,
        next: Allocation,
        outcome: Outcome,
        bound: bool,
    ) -> Result<AllocationState, AllocationError> {
        let allocation_id = current.id;
        if next == *current {
            if bound {
                self.inner.registry.unbind(allocation_id);
            }
            return Ok(current.state);
        }

        if let Err(e) = self.persist(&next, &outcome.history) {
            if bound {
                self.inner.registry.unbind(allocation_id);
            }
            error!(%allocation_id, error = %e, "Failed to persist transition, discarding it");
            return Err(e);
        }

        for entry in &outcome.history {
            info!(
                %allocation_id,
                from = %entry.from.map(|s| s.to_string()).unwrap_or_default(),
                to = %entry.to,
                cause = %entry.cause,
                "Allocation transition"
            );
        }

        *current = next;
        self.run_effects(current, outcome);
        if current.is_terminal() {
            self.evict(&allocation_id);
        }
        Ok(current.state)
    }

    /// The live record of a non-terminal allocation.
    pub async fn active(&self, allocation_id: &AllocationId) -> Option<Allocation> {
        let entry = self.entry(allocation_id)?;
        let allocation = entry.lock().await.clone();
        Some(allocation)
    }

    /// Current record and full history, from memory or the store.
    pub async fn get(&self, allocation_id: AllocationId) -> Result<AllocationDetail, AllocationError> {
        let allocation = match self.entry(&allocation_id) {
            Some(entry) => entry.lock().await.clone(),
            None => self
                .inner
                .store
                .load_allocation(&allocation_id)?
                .ok_or(AllocationError::NotFound(allocation_id))?,
        };
        let history = self.inner.store.load_history(&allocation_id)?;
        Ok(AllocationDetail {
            allocation,
            history,
        })
    }

    pub fn history(
        &self,
        allocation_id: AllocationId,
    ) -> Result<Vec<AllocationEventEnvelope>, AllocationError> {
        Ok(self.inner.store.load_history(&allocation_id)?)
    }

    /// Whether the controller has a live record for the allocation.
    pub fn is_active(&self, allocation_id: &AllocationId) -> bool {
        self.entry(allocation_id).is_some()
    }

    /// Every non-terminal allocation, ordered by id.
    pub async fn list_active(&self) -> Vec<Allocation> {
        let entries: Vec<Entry> = self.read().values().cloned().collect();
        let mut allocations = Vec::with_capacity(entries.len());
        for entry in entries {
            let allocation = entry.lock().await.clone();
            if !allocation.is_terminal() {
                allocations.push(allocation);
            }
        }
        allocations.sort_by_key(|a| a.id);
        allocations
    }

    /// Allocations of `pool` currently holding slots.
    pub async fn running_in(&self, pool: &str) -> Vec<RunningAllocation> {
        self.list_active()
            .await
            .into_iter()
            .filter(|a| a.pool() == pool && a.state.holds_slots())
            .map(|a| RunningAllocation {
                allocation_id: a.id,
                requester: a.request.requester.clone(),
                priority: a.request.priority,
                weight: a.request.weight,
                started_at: a.assigned_at.unwrap_or(a.request.submitted_at),
                state: a.state,
            })
            .collect()
    }

    /// Drain the inbox until shutdown. Only the first caller gets the inbox.
    #[instrument(skip(self, shutdown))]
    pub async fn run_event_pump(self, mut shutdown: watch::Receiver<bool>) {
        let inbox = self
            .inner
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut inbox) = inbox else {
            warn!("Controller event pump already running");
            return;
        };
        info!("Starting controller event pump");

        loop {
            tokio::select! {
                Some(message) = inbox.recv() => self.deliver(message).await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Controller event pump shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn deliver(&self, message: ControllerEvent) {
        let ControllerEvent {
            allocation_id,
            event,
        } = message;
        match self.handle(allocation_id, &event).await {
            Ok(_) => {}
            Err(AllocationError::NotFound(_)) => {
                debug!(%allocation_id, event = event.event_type(), "Event for finished allocation ignored")
            }
            Err(e) => warn!(%allocation_id, event = event.event_type(), error = %e, "Event not applied"),
        }
    }

    fn persist(
        &self,
        allocation: &Allocation,
        history: &[AllocationEventEnvelope],
    ) -> Result<(), AllocationError> {
        if history.is_empty() {
            self.inner.store.save_allocation(allocation)?;
        } else {
            self.inner.store.record_transitions(allocation, history)?;
        }
        Ok(())
    }

    fn run_effects(&self, allocation: &Allocation, outcome: Outcome) {
        let allocation_id = allocation.id;
        for effect in outcome.effects {
            match effect {
                Effect::ReleaseSlots => {
                    let released = self.inner.registry.unbind(allocation_id);
                    debug!(%allocation_id, released = released.len(), "Slots released");
                }
                Effect::SendStart { agents } => {
                    for agent_id in agents {
                        let spec = StartSpec {
                            allocation_id,
                            task_type: allocation.request.task_type.clone(),
                            name: allocation.request.name.clone(),
                            resources: allocation.request.resources.clone(),
                            slots: allocation
                                .slots
                                .iter()
                                .filter(|s| s.agent == agent_id)
                                .copied()
                                .collect(),
                        };
                        self.inner.dispatcher.start(agent_id, spec);
                    }
                }
                Effect::SendStop { agents, mode } => {
                    for agent_id in agents {
                        self.inner.dispatcher.stop(agent_id, allocation_id, mode);
                    }
                }
                Effect::ArmTimer(timer) => self.arm(allocation_id, timer),
                Effect::Dequeue => {
                    if let Some(pool) = self.inner.pools.get(allocation.pool()) {
                        pool.remove(&allocation_id);
                    }
                }
                Effect::CloseLogs => self.inner.logs.close(allocation_id),
            }
        }
    }

    fn arm(&self, allocation_id: AllocationId, timer: TimerEvent) {
        let delay = match timer {
            TimerEvent::StartDeadline => self.inner.settings.start_timeout,
            TimerEvent::StopGraceExpired | TimerEvent::ForceStopExpired => {
                self.inner.settings.stop_grace
            }
        };
        let events = self.inner.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let message = ControllerEvent {
                allocation_id,
                event: timer.into(),
            };
            // Closed only during shutdown.
            let _ = events.send(message).await;
        });
    }

    fn insert(&self, allocation: Allocation) {
        self.inner
            .allocations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(allocation.id, Arc::new(tokio::sync::Mutex::new(allocation)));
    }

    fn evict(&self, allocation_id: &AllocationId) {
        self.inner
            .allocations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(allocation_id);
    }

    fn entry(&self, allocation_id: &AllocationId) -> Option<Entry> {
        self.read().get(allocation_id).cloned()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<AllocationId, Entry>> {
        self.inner
            .allocations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gantry_events::{AgentEvent, DeviceKind, ExitOutcome, SignalEvent, TerminatingReason};
    use gantry_id::{AgentId, SlotId};
    use gantry_reconcile::BackoffPolicy;

    use super::*;
    use crate::agent::MockAgentRpc;
    use crate::config::PoolConfig;
    use crate::registry::AgentRegistration;

    struct Harness {
        controller: AllocationController,
        registry: Arc<Registry>,
        rpc: Arc<MockAgentRpc>,
        pool: Arc<ResourcePool>,
        agent: AgentId,
    }

    fn harness(settings: MasterSettings) -> Harness {
        let store = Store::open_in_memory().unwrap();
        let registry = Arc::new(Registry::new());
        let rpc = Arc::new(MockAgentRpc::new());
        let logs = Arc::new(LogAggregator::new(store.clone(), 500, 1024));
        let pool = Arc::new(ResourcePool::new(PoolConfig::named("compute")));
        let pools = Arc::new(BTreeMap::from([("compute".to_string(), pool.clone())]));

        let agent = AgentId::new();
        registry.register(AgentRegistration {
            agent_id: agent,
            pool: "compute".to_string(),
            labels: BTreeMap::new(),
            rpc_url: None,
            slots: vec![DeviceKind::gpu(); 4],
        });

        let controller =
            AllocationController::new(store, registry.clone(), rpc.clone(), logs, pools, settings);
        Harness {
            controller,
            registry,
            rpc,
            pool,
            agent,
        }
    }

    fn fast() -> MasterSettings {
        MasterSettings {
            rpc_backoff: BackoffPolicy::immediate(),
            ..MasterSettings::default()
        }
    }

    async fn wait_for(controller: &AllocationController, id: AllocationId, state: AllocationState) {
        for _ in 0..200 {
            if controller.get(id).await.unwrap().allocation.state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("allocation {id} never reached {state}");
    }

    fn slots(agent: AgentId, n: u32) -> Vec<SlotId> {
        (0..n).map(|i| SlotId::new(agent, i)).collect()
    }

    #[tokio::test]
    async fn test_assign_binds_and_starts() {
        let h = harness(fast());
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(h.controller.clone().run_event_pump(rx));

        let alloc = h
            .controller
            .create(TaskRequest::builder("compute").gpus(2).build())
            .unwrap();
        h.pool.enqueue(alloc.request.clone()).unwrap();

        let state = h
            .controller
            .handle(alloc.id, &SchedulerEvent::Assign { slots: slots(h.agent, 2) }.into())
            .await
            .unwrap();
        assert_eq!(state, AllocationState::Assigned);
        assert_eq!(h.registry.slots_of(&alloc.id).len(), 2);
        assert_eq!(h.pool.pending_len(), 0);

        wait_for(&h.controller, alloc.id, AllocationState::Starting).await;
        assert_eq!(h.rpc.starts(), vec![(h.agent, alloc.id)]);
    }

    #[tokio::test]
    async fn test_capacity_conflict_fails_allocation() {
        let h = harness(fast());
        let holder = AllocationId::new();
        h.registry.bind(&slots(h.agent, 1), holder).unwrap();

        let alloc = h
            .controller
            .create(TaskRequest::builder("compute").gpus(1).build())
            .unwrap();
        let state = h
            .controller
            .handle(alloc.id, &SchedulerEvent::Assign { slots: slots(h.agent, 1) }.into())
            .await
            .unwrap();
        assert_eq!(
            state,
            AllocationState::Terminated {
                outcome: ExitOutcome::Failed
            }
        );
        assert_eq!(h.registry.slots_of(&holder).len(), 1);
        assert!(!h.controller.is_active(&alloc.id));

        let detail = h.controller.get(alloc.id).await.unwrap();
        assert!(detail
            .history
            .iter()
            .any(|e| e.cause == event_types::REGISTRY_CONFLICT));
    }

    #[tokio::test]
    async fn test_unknown_slot_leaves_allocation_pending() {
        let h = harness(fast());
        let alloc = h
            .controller
            .create(TaskRequest::builder("compute").gpus(1).build())
            .unwrap();
        let err = h
            .controller
            .handle(
                alloc.id,
                &SchedulerEvent::Assign {
                    slots: vec![SlotId::new(AgentId::new(), 0)],
                }
                .into(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::BindRejected { .. }));
        assert_eq!(
            h.controller.get(alloc.id).await.unwrap().allocation.state,
            AllocationState::Pending
        );
    }

    #[tokio::test]
    async fn test_history_is_monotonic_through_completion() {
        let h = harness(fast());
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(h.controller.clone().run_event_pump(rx));

        let alloc = h
            .controller
            .create(TaskRequest::builder("compute").gpus(2).build())
            .unwrap();
        h.controller
            .handle(alloc.id, &SchedulerEvent::Assign { slots: slots(h.agent, 2) }.into())
            .await
            .unwrap();
        wait_for(&h.controller, alloc.id, AllocationState::Starting).await;

        for signal in [SignalEvent::Ready, SignalEvent::Waiting, SignalEvent::Ready] {
            h.controller.handle(alloc.id, &signal.into()).await.unwrap();
        }
        let state = h
            .controller
            .handle(
                alloc.id,
                &AgentEvent::Exited {
                    agent_id: h.agent,
                    success: true,
                    exit_code: Some(0),
                }
                .into(),
            )
            .await
            .unwrap();
        assert_eq!(
            state,
            AllocationState::Terminated {
                outcome: ExitOutcome::Success
            }
        );
        assert!(h.registry.slots_of(&alloc.id).is_empty());

        let history = h.controller.history(alloc.id).unwrap();
        let seqs: Vec<u64> = history.iter().map(|e| e.seq.value()).collect();
        assert_eq!(seqs, (1..=history.len() as u64).collect::<Vec<_>>());
        assert!(history.windows(2).all(|w| w[0].to.rank() <= w[1].to.rank()));
        assert_eq!(
            history.last().unwrap().to,
            AllocationState::Terminated {
                outcome: ExitOutcome::Success
            }
        );
    }

    #[tokio::test]
    async fn test_start_deadline_fails_unacknowledged_start() {
        let h = harness(MasterSettings {
            start_timeout: Duration::from_millis(20),
            stop_grace: Duration::from_millis(20),
            ..fast()
        });
        h.rpc.set_unreachable(h.agent, true);
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(h.controller.clone().run_event_pump(rx));

        let alloc = h
            .controller
            .create(TaskRequest::builder("compute").gpus(1).build())
            .unwrap();
        h.controller
            .handle(alloc.id, &SchedulerEvent::Assign { slots: slots(h.agent, 1) }.into())
            .await
            .unwrap();

        wait_for(
            &h.controller,
            alloc.id,
            AllocationState::Terminated {
                outcome: ExitOutcome::Failed,
            },
        )
        .await;
        assert!(h.registry.slots_of(&alloc.id).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_running_stops_gracefully() {
        let h = harness(fast());
        let (_tx, rx) = watch::channel(false);
        tokio::spawn(h.controller.clone().run_event_pump(rx));

        let alloc = h
            .controller
            .create(TaskRequest::builder("compute").gpus(1).build())
            .unwrap();
        h.controller
            .handle(alloc.id, &SchedulerEvent::Assign { slots: slots(h.agent, 1) }.into())
            .await
            .unwrap();
        h.controller
            .handle(alloc.id, &SignalEvent::Ready.into())
            .await
            .unwrap();

        let state = h
            .controller
            .handle(alloc.id, &SignalEvent::Cancel.into())
            .await
            .unwrap();
        assert_eq!(
            state,
            AllocationState::Terminating {
                reason: TerminatingReason::Cancelled
            }
        );
        assert!(h.registry.slots_of(&alloc.id).is_empty());
        assert_eq!(h.controller.running_in("compute").await.len(), 0);
    }

    #[tokio::test]
    async fn test_running_in_reports_slot_holders() {
        let h = harness(fast());
        let waiting = h
            .controller
            .create(TaskRequest::builder("compute").gpus(1).build())
            .unwrap();
        let placed = h
            .controller
            .create(TaskRequest::builder("compute").gpus(1).priority(7).build())
            .unwrap();
        h.controller
            .handle(placed.id, &SchedulerEvent::Assign { slots: slots(h.agent, 1) }.into())
            .await
            .unwrap();

        let running = h.controller.running_in("compute").await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].allocation_id, placed.id);
        assert_eq!(running[0].priority, 7);
        assert_eq!(h.controller.list_active().await.len(), 2);
        assert!(h.controller.is_active(&waiting.id));
    }
}
