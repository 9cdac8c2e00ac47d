//! Reattachment after a master restart or an agent reconnect.
//!
//! At startup every persisted non-terminal allocation is restored into the
//! controller. Pending ones go back to their pool's queue; the rest are
//! checked against their agents and resumed, settled, or torn down. Pools
//! holding such allocations stay gated until this finishes so nothing is
//! placed onto slots the registry has not yet accounted for.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use gantry_events::{event_types, AgentEvent, AgentHealth, AllocationState, LiveStatus, StopMode};
use gantry_id::{AgentId, AllocationId, SlotId};
use gantry_reconcile::{classify_reattach, Deadline, ReattachDecision, ReattachObservation};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::{Allocation, AllocationController, AllocationError};
use crate::db::Store;
use crate::pool::ResourcePool;
use crate::registry::Registry;

/// Lower bound for a status query once the grace period has run out, so
/// agents that did show up still get asked.
const STATUS_FLOOR: Duration = Duration::from_millis(250);

/// Counts of what one startup reconciliation did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReattachReport {
    pub requeued: usize,
    pub resumed: usize,
    pub settled: usize,
    pub torn_down: usize,
    pub continued: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl ReattachReport {
    fn record(&mut self, decision: ReattachDecision) {
        match decision {
            ReattachDecision::Unchanged => self.unchanged += 1,
            ReattachDecision::Resume { .. } => self.resumed += 1,
            ReattachDecision::Settle { .. } => self.settled += 1,
            ReattachDecision::Teardown { .. } => self.torn_down += 1,
            ReattachDecision::ContinueTeardown => self.continued += 1,
        }
    }
}

/// Allocations restored by [`Reattacher::prepare`] that still have to be
/// checked against their agents.
#[derive(Default)]
struct Prepared {
    gated: BTreeSet<String>,
    live: Vec<Allocation>,
    report: ReattachReport,
}

pub struct Reattacher {
    controller: AllocationController,
    registry: Arc<Registry>,
    store: Store,
    pools: Arc<BTreeMap<String, Arc<ResourcePool>>>,
    grace: Duration,
    startup: AtomicBool,
    prepared: Mutex<Option<Prepared>>,
}

impl Reattacher {
    pub fn new(
        controller: AllocationController,
        registry: Arc<Registry>,
        store: Store,
        pools: Arc<BTreeMap<String, Arc<ResourcePool>>>,
        grace: Duration,
    ) -> Self {
        Self {
            controller,
            registry,
            store,
            pools,
            grace,
            startup: AtomicBool::new(false),
            prepared: Mutex::new(None),
        }
    }

    /// Load persisted allocations, gate the pools holding live ones, restore
    /// them into the controller, and requeue pending requests.
    ///
    /// Must complete before agents can connect or any pass runs, so agent
    /// handshakes find the restored records and nothing lands on slots that
    /// are not re-bound yet.
    pub fn prepare(&self) -> Result<(), AllocationError> {
        self.startup.store(true, Ordering::SeqCst);
        let prepared = match self.restore_persisted() {
            Ok(prepared) => prepared,
            Err(e) => {
                self.startup.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self.prepared.lock().unwrap_or_else(PoisonError::into_inner) = Some(prepared);
        Ok(())
    }

    /// Startup reconciliation. Prepares first unless [`Reattacher::prepare`]
    /// already ran, then waits for agents until the grace period is over and
    /// settles every restored allocation.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<ReattachReport, AllocationError> {
        let taken = self.take_prepared();
        let prepared = match taken {
            Some(prepared) => prepared,
            None => {
                self.prepare()?;
                self.take_prepared().unwrap_or_default()
            }
        };
        let report = self.reconcile_live(prepared).await;
        self.startup.store(false, Ordering::SeqCst);
        Ok(report)
    }

    fn take_prepared(&self) -> Option<Prepared> {
        self.prepared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn restore_persisted(&self) -> Result<Prepared, AllocationError> {
        let persisted = self.store.load_active_allocations()?;
        let mut report = ReattachReport::default();

        // Gate before anything is requeued so no pass can run in between.
        let gated: BTreeSet<String> = persisted
            .iter()
            .filter(|a| a.state != AllocationState::Pending)
            .map(|a| a.pool().to_string())
            .collect();
        self.set_gated(&gated, true);

        let mut requeued = BTreeSet::new();
        let mut live = Vec::new();
        for allocation in persisted {
            if allocation.state == AllocationState::Pending {
                match self.pools.get(allocation.pool()) {
                    Some(pool) => {
                        pool.requeue(allocation.request.clone());
                        requeued.insert(allocation.pool().to_string());
                        report.requeued += 1;
                    }
                    None => warn!(
                        allocation_id = %allocation.id,
                        pool = %allocation.pool(),
                        "Pending allocation targets a pool that no longer exists"
                    ),
                }
            } else {
                live.push(allocation.clone());
            }
            self.controller.restore(allocation);
        }
        for name in &requeued {
            if let Some(pool) = self.pools.get(name) {
                pool.notify();
            }
        }

        info!(
            requeued = report.requeued,
            live = live.len(),
            pools = ?gated,
            "Persisted allocations restored"
        );
        Ok(Prepared {
            gated,
            live,
            report,
        })
    }

    async fn reconcile_live(&self, prepared: Prepared) -> ReattachReport {
        let Prepared {
            gated,
            live,
            mut report,
        } = prepared;
        if live.is_empty() {
            info!(requeued = report.requeued, "Nothing to reattach");
            self.set_gated(&gated, false);
            return report;
        }
        info!(allocations = live.len(), pools = ?gated, "Reattaching allocations");

        let deadline = Deadline::after(self.grace);
        let needed: BTreeSet<AgentId> = live.iter().flat_map(|a| a.remaining_agents()).collect();
        self.wait_for_agents(&needed, &deadline).await;

        let results = join_all(live.iter().map(|a| self.reconcile(a, &deadline))).await;
        for (allocation, result) in live.iter().zip(results) {
            match result {
                Ok(decision) => report.record(decision),
                Err(e) => {
                    report.failed += 1;
                    warn!(allocation_id = %allocation.id, error = %e, "Reattachment failed");
                }
            }
        }

        self.set_gated(&gated, false);
        info!(?report, "Reattachment complete");
        report
    }

    /// Check one allocation against its agents and act on the answer.
    pub async fn reconcile(
        &self,
        allocation: &Allocation,
        deadline: &Deadline,
    ) -> Result<ReattachDecision, AllocationError> {
        let agents = allocation.remaining_agents();
        let timeout = deadline.remaining().max(STATUS_FLOOR);
        let answers = join_all(agents.iter().map(|agent_id| async move {
            if !self.reachable(agent_id) {
                return None;
            }
            self.controller
                .dispatcher()
                .status(*agent_id, allocation.id, timeout)
                .await
        }))
        .await;

        let observation = if agents.is_empty() {
            ReattachObservation::Live(LiveStatus::Gone)
        } else {
            ReattachObservation::combine(answers)
        };
        let decision = classify_reattach(allocation.state, observation);
        debug!(
            allocation_id = %allocation.id,
            state = %allocation.state,
            ?observation,
            ?decision,
            "Reattach decision"
        );

        match decision {
            ReattachDecision::Unchanged => {}
            ReattachDecision::Resume { state } => {
                if self.rebind(allocation.id, &allocation.slots).await? {
                    let status = match state {
                        AllocationState::Waiting => LiveStatus::Waiting,
                        _ => LiveStatus::Running,
                    };
                    self.controller
                        .handle(allocation.id, &AgentEvent::Reattached { status }.into())
                        .await?;
                }
            }
            ReattachDecision::Settle { .. } => {
                self.controller
                    .handle(allocation.id, &AgentEvent::Vanished.into())
                    .await?;
            }
            ReattachDecision::Teardown { .. } => {
                self.controller
                    .handle(allocation.id, &AgentEvent::Unreachable.into())
                    .await?;
            }
            ReattachDecision::ContinueTeardown => {
                self.controller
                    .handle(
                        allocation.id,
                        &AgentEvent::Reattached {
                            status: LiveStatus::Running,
                        }
                        .into(),
                    )
                    .await?;
            }
        }
        Ok(decision)
    }

    /// Reconcile an agent's handshake against the controller's records.
    ///
    /// Allocations the agent runs that the controller does not place there
    /// are orphans and get force-stopped. Live allocations it runs are
    /// re-bound. Live allocations it should run but did not list are lost.
    pub async fn on_agent_connected(&self, agent_id: AgentId, running: &[AllocationId]) {
        let listed: BTreeSet<AllocationId> = running.iter().copied().collect();

        for allocation_id in &listed {
            let allocation = self
                .controller
                .active(allocation_id)
                .await
                .filter(|a| a.agents().contains(&agent_id));
            let Some(allocation) = allocation else {
                info!(%agent_id, %allocation_id, "Stopping orphaned allocation");
                self.controller
                    .dispatcher()
                    .stop(agent_id, *allocation_id, StopMode::Force);
                continue;
            };

            let result = if allocation.state.holds_slots() {
                let mine: Vec<SlotId> = allocation
                    .slots
                    .iter()
                    .filter(|s| s.agent == agent_id)
                    .copied()
                    .collect();
                self.rebind(allocation.id, &mine).await.map(|_| ())
            } else if allocation.state.is_terminating() {
                self.controller
                    .handle(
                        allocation.id,
                        &AgentEvent::Reattached {
                            status: LiveStatus::Running,
                        }
                        .into(),
                    )
                    .await
                    .map(|_| ())
            } else {
                Ok(())
            };
            if let Err(e) = result {
                warn!(%agent_id, %allocation_id, error = %e, "Failed to reattach allocation");
            }
        }

        // Startup reconciliation asks the agents itself.
        if self.startup.load(Ordering::SeqCst) {
            return;
        }

        for allocation in self.controller.list_active().await {
            let acknowledged = matches!(
                allocation.state,
                AllocationState::Starting
                    | AllocationState::Waiting
                    | AllocationState::Running
                    | AllocationState::Terminating { .. }
            );
            if !acknowledged
                || listed.contains(&allocation.id)
                || !allocation.remaining_agents().contains(&agent_id)
            {
                continue;
            }
            info!(%agent_id, allocation_id = %allocation.id, "Agent no longer runs allocation");
            if let Err(e) = self
                .controller
                .handle(allocation.id, &AgentEvent::Lost { agent_id }.into())
                .await
            {
                warn!(%agent_id, allocation_id = %allocation.id, error = %e, "Failed to mark allocation lost");
            }
        }
    }

    /// Bind the recorded slots again. A refusal fails the allocation.
    async fn rebind(&self, allocation_id: AllocationId, slots: &[SlotId]) -> Result<bool, AllocationError> {
        match self.registry.bind(slots, allocation_id) {
            Ok(()) => Ok(true),
            Err(e) => {
                error!(
                    %allocation_id,
                    error = %e,
                    invariant_violation = true,
                    "Recorded slots cannot be re-bound"
                );
                self.controller
                    .force_fail(allocation_id, event_types::REGISTRY_CONFLICT, e.to_string())
                    .await?;
                Ok(false)
            }
        }
    }

    async fn wait_for_agents(&self, needed: &BTreeSet<AgentId>, deadline: &Deadline) {
        let mut events = self.registry.subscribe();
        loop {
            let missing = needed.iter().filter(|a| !self.reachable(a)).count();
            if missing == 0 {
                return;
            }
            if deadline.is_expired() {
                warn!(missing, "Reattach grace period over with agents still missing");
                return;
            }
            tokio::select! {
                _ = events.recv() => {}
                _ = tokio::time::sleep(deadline.remaining()) => {}
            }
        }
    }

    fn set_gated(&self, names: &BTreeSet<String>, gated: bool) {
        for name in names {
            if let Some(pool) = self.pools.get(name) {
                pool.set_gated(gated);
            }
        }
    }

    fn reachable(&self, agent_id: &AgentId) -> bool {
        self.registry
            .health(agent_id)
            .is_some_and(|h| h != AgentHealth::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use gantry_events::{DeviceKind, ExitOutcome, SchedulerEvent, SignalEvent, TerminatingReason};
    use gantry_reconcile::BackoffPolicy;

    use super::*;
    use crate::agent::{MockAgentRpc, RpcCall};
    use crate::config::{MasterSettings, PoolConfig};
    use crate::logs::LogAggregator;
    use crate::pool::TaskRequest;
    use crate::registry::AgentRegistration;

    struct World {
        store: Store,
        registry: Arc<Registry>,
        rpc: Arc<MockAgentRpc>,
        pools: Arc<BTreeMap<String, Arc<ResourcePool>>>,
        controller: AllocationController,
    }

    fn settings() -> MasterSettings {
        MasterSettings {
            rpc_backoff: BackoffPolicy::immediate(),
            rpc_max_attempts: 2,
            ..MasterSettings::default()
        }
    }

    /// A fresh master process over an existing store.
    fn boot(store: Store) -> World {
        let registry = Arc::new(Registry::new());
        let rpc = Arc::new(MockAgentRpc::new());
        let logs = Arc::new(LogAggregator::new(store.clone(), 500, 1024));
        let pools = Arc::new(BTreeMap::from([(
            "compute".to_string(),
            Arc::new(ResourcePool::new(PoolConfig::named("compute"))),
        )]));
        let controller = AllocationController::new(
            store.clone(),
            registry.clone(),
            rpc.clone(),
            logs,
            pools.clone(),
            settings(),
        );
        World {
            store,
            registry,
            rpc,
            pools,
            controller,
        }
    }

    fn connect(registry: &Registry, agent_id: AgentId) {
        registry.register(AgentRegistration {
            agent_id,
            pool: "compute".to_string(),
            labels: BTreeMap::new(),
            rpc_url: None,
            slots: vec![DeviceKind::gpu(); 2],
        });
    }

    fn reattacher(world: &World, grace: Duration) -> Reattacher {
        Reattacher::new(
            world.controller.clone(),
            world.registry.clone(),
            world.store.clone(),
            world.pools.clone(),
            grace,
        )
    }

    /// Runs an allocation to `Running` on `agent` in a first process.
    async fn running_allocation(store: &Store, agent: AgentId) -> AllocationId {
        let first = boot(store.clone());
        connect(&first.registry, agent);
        let alloc = first
            .controller
            .create(TaskRequest::builder("compute").gpus(2).build())
            .unwrap();
        first
            .controller
            .handle(
                alloc.id,
                &SchedulerEvent::Assign {
                    slots: vec![SlotId::new(agent, 0), SlotId::new(agent, 1)],
                }
                .into(),
            )
            .await
            .unwrap();
        first
            .controller
            .handle(alloc.id, &SignalEvent::Ready.into())
            .await
            .unwrap();
        alloc.id
    }

    #[tokio::test]
    async fn test_resumes_live_allocation_and_rebinds() {
        let store = Store::open_in_memory().unwrap();
        let agent = AgentId::new();
        let id = running_allocation(&store, agent).await;

        let world = boot(store);
        connect(&world.registry, agent);
        world.rpc.set_status(agent, id, LiveStatus::Waiting);

        let report = reattacher(&world, Duration::from_millis(200)).run().await.unwrap();
        assert_eq!(report.resumed, 1);
        assert_eq!(world.registry.slots_of(&id).len(), 2);
        let detail = world.controller.get(id).await.unwrap();
        assert_eq!(detail.allocation.state, AllocationState::Waiting);
        assert!(world.rpc.starts().is_empty());
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let agent = AgentId::new();
        let id = running_allocation(&store, agent).await;

        let world = boot(store);
        connect(&world.registry, agent);
        world.rpc.set_status(agent, id, LiveStatus::Running);
        let reattacher = reattacher(&world, Duration::from_millis(200));

        reattacher.run().await.unwrap();
        let version = world.registry.version();
        let history = world.controller.history(id).unwrap().len();

        let report = reattacher.run().await.unwrap();
        assert_eq!(report.resumed, 1);
        assert_eq!(world.registry.version(), version);
        assert_eq!(world.controller.history(id).unwrap().len(), history);
    }

    #[tokio::test]
    async fn test_gone_allocation_is_settled_as_lost() {
        let store = Store::open_in_memory().unwrap();
        let agent = AgentId::new();
        let id = running_allocation(&store, agent).await;

        let world = boot(store);
        connect(&world.registry, agent);

        let report = reattacher(&world, Duration::from_millis(200)).run().await.unwrap();
        assert_eq!(report.settled, 1);
        let detail = world.controller.get(id).await.unwrap();
        assert_eq!(
            detail.allocation.state,
            AllocationState::Terminated {
                outcome: ExitOutcome::AgentLost
            }
        );
        assert!(world.registry.slots_of(&id).is_empty());
    }

    #[tokio::test]
    async fn test_missing_agent_is_torn_down_after_grace() {
        let store = Store::open_in_memory().unwrap();
        let agent = AgentId::new();
        let id = running_allocation(&store, agent).await;

        let world = boot(store);
        let pool = world.pools["compute"].clone();
        let reattacher = reattacher(&world, Duration::from_millis(30));

        let report = reattacher.run().await.unwrap();
        assert_eq!(report.torn_down, 1);
        assert!(!pool.is_gated());
        let state = world.controller.get(id).await.unwrap().allocation.state;
        assert_eq!(
            state,
            AllocationState::Terminating {
                reason: TerminatingReason::AgentLost
            }
        );
    }

    #[tokio::test]
    async fn test_handshake_after_prepare_keeps_live_allocation() {
        let store = Store::open_in_memory().unwrap();
        let agent = AgentId::new();
        let id = running_allocation(&store, agent).await;

        let world = boot(store);
        let reattacher = reattacher(&world, Duration::from_millis(200));
        reattacher.prepare().unwrap();
        assert!(world.pools["compute"].is_gated());
        assert!(world.controller.is_active(&id));

        connect(&world.registry, agent);
        world.rpc.set_status(agent, id, LiveStatus::Running);
        reattacher.on_agent_connected(agent, &[id]).await;
        assert_eq!(world.registry.slots_of(&id).len(), 2);

        let report = reattacher.run().await.unwrap();
        assert_eq!(report.resumed, 1);
        assert!(!world.pools["compute"].is_gated());
        assert!(world.rpc.stops().is_empty());
        let detail = world.controller.get(id).await.unwrap();
        assert_eq!(detail.allocation.state, AllocationState::Running);
    }

    #[tokio::test]
    async fn test_pending_allocations_are_requeued() {
        let store = Store::open_in_memory().unwrap();
        let first = boot(store.clone());
        let alloc = first
            .controller
            .create(TaskRequest::builder("compute").gpus(1).build())
            .unwrap();

        let world = boot(store);
        let report = reattacher(&world, Duration::from_millis(10)).run().await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(world.pools["compute"].pending()[0].allocation_id, alloc.id);
        assert!(world.controller.is_active(&alloc.id));
    }

    #[tokio::test]
    async fn test_handshake_stops_orphans_and_marks_missing_lost() {
        let store = Store::open_in_memory().unwrap();
        let agent = AgentId::new();
        let id = running_allocation(&store, agent).await;

        let world = boot(store);
        connect(&world.registry, agent);
        world.rpc.set_status(agent, id, LiveStatus::Running);
        let reattacher = reattacher(&world, Duration::from_millis(200));
        reattacher.run().await.unwrap();

        let orphan = AllocationId::new();
        reattacher.on_agent_connected(agent, &[orphan]).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(world.rpc.calls().contains(&RpcCall::Stop {
            agent_id: agent,
            allocation_id: orphan,
            mode: StopMode::Force,
        }));
        let state = world.controller.get(id).await.unwrap().allocation.state;
        assert!(state.rank() >= AllocationState::Terminating {
            reason: TerminatingReason::AgentLost
        }
        .rank());
    }
}
