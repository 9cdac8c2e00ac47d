//! The master: every component wired together behind one handle.
//!
//! HTTP handlers, workers, and tests all drive the system through
//! [`Master`]. It owns no state of its own beyond readiness; each call is
//! routed to the registry, a pool, the allocation controller, or the log
//! aggregator.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use gantry_events::{
    AgentEvent, AllocationEvent, AllocationState, DeviceKind, LogEntry, LogFields, LogRecord,
    SchedulerEvent, SignalEvent, TerminatingReason,
};
use gantry_id::{AgentId, AllocationId, Seq};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::agent::AgentRpc;
use crate::allocation::reattach::ReattachReport;
use crate::allocation::{
    Allocation, AllocationController, AllocationDetail, AllocationError, Reattacher,
};
use crate::config::{MasterSettings, PoolConfig};
use crate::db::Store;
use crate::error::MasterError;
use crate::heartbeat::HeartbeatMonitor;
use crate::logs::{LogAggregator, LogQuery};
use crate::pool::{PoolError, ResourcePool, TaskRequest};
use crate::registry::{AgentRegistration, AgentView, Registry};
use crate::scheduler::{PassInput, PassReport, SchedulerWorker};

/// Per-pool capacity and queue summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSummary {
    pub name: String,
    pub policy: &'static str,
    pub pending: usize,
    pub max_pending: usize,
    pub gated: bool,
    pub agents: usize,
    pub total_slots: usize,
    /// Free schedulable slots by device kind.
    pub free: BTreeMap<String, usize>,
    /// Bound slots by device kind.
    pub bound: BTreeMap<String, usize>,
}

fn by_kind_name(counts: BTreeMap<DeviceKind, usize>) -> BTreeMap<String, usize> {
    counts
        .into_iter()
        .map(|(kind, n)| (kind.to_string(), n))
        .collect()
}

#[derive(Clone)]
pub struct Master {
    inner: Arc<Inner>,
}

struct Inner {
    settings: MasterSettings,
    store: Store,
    registry: Arc<Registry>,
    pools: Arc<BTreeMap<String, Arc<ResourcePool>>>,
    controller: AllocationController,
    reattacher: Reattacher,
    logs: Arc<LogAggregator>,
    ready: AtomicBool,
}

impl Master {
    /// Wire up the components. The historical agent inventory is loaded
    /// so feasibility checks survive restarts; reattachment is a separate
    /// step, see [`Master::reattach`].
    pub fn new(
        store: Store,
        registry: Arc<Registry>,
        rpc: Arc<dyn AgentRpc>,
        pool_configs: Vec<PoolConfig>,
        settings: MasterSettings,
    ) -> Result<Self, MasterError> {
        let pools: BTreeMap<String, Arc<ResourcePool>> = pool_configs
            .into_iter()
            .map(|config| (config.name.clone(), Arc::new(ResourcePool::new(config))))
            .collect();

        for row in store.load_inventory()? {
            match pools.get(&row.pool) {
                Some(pool) => pool.record_agent(row.agent_id, row.slots),
                None => debug!(
                    agent_id = %row.agent_id,
                    pool = %row.pool,
                    "Ignoring inventory of unconfigured pool"
                ),
            }
        }
        let pools = Arc::new(pools);

        let logs = Arc::new(LogAggregator::new(
            store.clone(),
            settings.max_log_batch,
            settings.max_log_message_bytes,
        ));
        let controller = AllocationController::new(
            store.clone(),
            registry.clone(),
            rpc,
            logs.clone(),
            pools.clone(),
            settings.clone(),
        );
        let reattacher = Reattacher::new(
            controller.clone(),
            registry.clone(),
            store.clone(),
            pools.clone(),
            settings.reattach_grace,
        );

        info!(pools = pools.len(), "Master initialized");
        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                store,
                registry,
                pools,
                controller,
                reattacher,
                logs,
                ready: AtomicBool::new(false),
            }),
        })
    }

    pub fn settings(&self) -> &MasterSettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn controller(&self) -> &AllocationController {
        &self.inner.controller
    }

    pub fn pool(&self, name: &str) -> Result<Arc<ResourcePool>, PoolError> {
        self.inner
            .pools
            .get(name)
            .cloned()
            .ok_or_else(|| PoolError::UnknownPool(name.to_string()))
    }

    pub fn pools(&self) -> impl Iterator<Item = &Arc<ResourcePool>> {
        self.inner.pools.values()
    }

    // =========================================================================
    // Requests and allocations
    // =========================================================================

    /// Admit a task request. The allocation is returned in `Pending`.
    pub async fn submit(&self, request: TaskRequest) -> Result<Allocation, MasterError> {
        let pool = self.pool(&request.pool)?;
        pool.check_admission(&request)?;

        let allocation = self.inner.controller.create(request.clone())?;
        if let Err(e) = pool.enqueue(request) {
            // Lost a race for the last queue position.
            let cancel = AllocationEvent::Signal(SignalEvent::Cancel);
            if let Err(cancel_err) = self.inner.controller.handle(allocation.id, &cancel).await {
                warn!(
                    allocation_id = %allocation.id,
                    error = %cancel_err,
                    "Failed to cancel unqueued allocation"
                );
            }
            return Err(e.into());
        }

        info!(
            allocation_id = %allocation.id,
            pool = %allocation.pool(),
            slots = allocation.request.resources.slots,
            device = %allocation.request.resources.device,
            "Task request admitted"
        );
        Ok(allocation)
    }

    /// Cancel a pending or running allocation.
    pub async fn cancel(&self, allocation_id: AllocationId) -> Result<AllocationState, MasterError> {
        let cancel = AllocationEvent::Signal(SignalEvent::Cancel);
        match self.inner.controller.handle(allocation_id, &cancel).await {
            Err(AllocationError::NotFound(_)) => {
                let detail = self.inner.controller.get(allocation_id).await?;
                Err(AllocationError::InvalidTransition {
                    allocation_id,
                    from: detail.allocation.state,
                    to: AllocationState::Terminating {
                        reason: TerminatingReason::Cancelled,
                    },
                }
                .into())
            }
            result => Ok(result?),
        }
    }

    /// The task reports readiness. Unknown or finished allocations are
    /// ignored and yield `None`.
    pub async fn mark_ready(
        &self,
        allocation_id: AllocationId,
    ) -> Result<Option<AllocationState>, MasterError> {
        self.signal(allocation_id, SignalEvent::Ready).await
    }

    /// The task reports it is waiting. Same tolerance as [`Master::mark_ready`].
    pub async fn mark_waiting(
        &self,
        allocation_id: AllocationId,
    ) -> Result<Option<AllocationState>, MasterError> {
        self.signal(allocation_id, SignalEvent::Waiting).await
    }

    async fn signal(
        &self,
        allocation_id: AllocationId,
        signal: SignalEvent,
    ) -> Result<Option<AllocationState>, MasterError> {
        let event = AllocationEvent::Signal(signal);
        match self.inner.controller.handle(allocation_id, &event).await {
            Ok(state) => Ok(Some(state)),
            Err(AllocationError::NotFound(_)) => {
                debug!(%allocation_id, ?signal, "Ignoring signal for inactive allocation");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, allocation_id: AllocationId) -> Result<AllocationDetail, MasterError> {
        Ok(self.inner.controller.get(allocation_id).await?)
    }

    pub async fn list_active(&self) -> Vec<Allocation> {
        self.inner.controller.list_active().await
    }

    // =========================================================================
    // Agents
    // =========================================================================

    /// Agent handshake. `running` lists the allocations the agent still runs.
    pub async fn register_agent(
        &self,
        registration: AgentRegistration,
        running: &[AllocationId],
    ) -> Result<(), MasterError> {
        let pool = self.pool(&registration.pool)?;
        if registration.slots.is_empty() {
            return Err(PoolError::InvalidRequest("agent offers no slots".to_string()).into());
        }
        if !pool.config().agents.matches(&registration.labels) {
            return Err(PoolError::InvalidRequest(format!(
                "agent {} does not satisfy the eligibility rule of pool {}",
                registration.agent_id,
                pool.name()
            ))
            .into());
        }

        let agent_id = registration.agent_id;
        self.inner.store.upsert_agent(
            &agent_id,
            pool.name(),
            &registration.slots,
            Utc::now(),
        )?;
        pool.record_agent(agent_id, registration.slots.clone());

        let outcome = self.inner.registry.register(registration);
        for allocation_id in outcome.released {
            self.lose(allocation_id, agent_id).await;
        }
        self.inner
            .reattacher
            .on_agent_connected(agent_id, running)
            .await;
        pool.notify();
        Ok(())
    }

    pub async fn deregister_agent(&self, agent_id: &AgentId) -> Result<(), MasterError> {
        let affected = self.inner.registry.deregister(agent_id)?;
        for allocation_id in affected {
            self.lose(allocation_id, *agent_id).await;
        }
        Ok(())
    }

    pub fn heartbeat(&self, agent_id: &AgentId) -> Result<(), MasterError> {
        Ok(self.inner.registry.heartbeat(agent_id)?)
    }

    pub fn drain(&self, agent_id: &AgentId) -> Result<(), MasterError> {
        Ok(self.inner.registry.drain(agent_id)?)
    }

    pub fn agents(&self) -> Vec<AgentView> {
        self.inner.registry.agents()
    }

    /// An agent reports that an allocation's process exited.
    pub async fn agent_exited(
        &self,
        agent_id: AgentId,
        allocation_id: AllocationId,
        success: bool,
        exit_code: Option<i32>,
    ) -> Result<Option<AllocationState>, MasterError> {
        let event = AllocationEvent::Agent(AgentEvent::Exited {
            agent_id,
            success,
            exit_code,
        });
        match self.inner.controller.handle(allocation_id, &event).await {
            Ok(state) => Ok(Some(state)),
            Err(AllocationError::NotFound(_)) => {
                debug!(%agent_id, %allocation_id, "Exit report for inactive allocation");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Disconnect agents past the heartbeat deadline and fail over their
    /// allocations. Returns the number of agents expired.
    pub async fn expire_heartbeats(&self) -> usize {
        let expired = self
            .inner
            .registry
            .expire_heartbeats(self.inner.settings.heartbeat_timeout);
        let count = expired.len();
        for (agent_id, affected) in expired {
            for allocation_id in affected {
                self.lose(allocation_id, agent_id).await;
            }
        }
        count
    }

    async fn lose(&self, allocation_id: AllocationId, agent_id: AgentId) {
        let event = AllocationEvent::Agent(AgentEvent::Lost { agent_id });
        if let Err(e) = self.inner.controller.handle(allocation_id, &event).await {
            warn!(%allocation_id, %agent_id, error = %e, "Failed to record lost agent");
        }
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Run one scheduling pass over a pool. Passes for one pool never
    /// overlap.
    pub async fn schedule_pass(&self, pool_name: &str) -> Result<PassReport, MasterError> {
        let pool = self.pool(pool_name)?;
        let _pass = pool.lock_pass().await;

        if pool.is_gated() {
            return Ok(PassReport {
                gated: true,
                pending: pool.pending_len(),
                ..PassReport::default()
            });
        }

        let pending = pool.pending();
        if pending.is_empty() {
            return Ok(PassReport::default());
        }

        let controller = &self.inner.controller;
        let running = controller.running_in(pool_name).await;
        let snapshot = self.inner.registry.snapshot(pool_name);
        let decision = pool.policy().schedule(&PassInput {
            now: Utc::now(),
            pending: &pending,
            running: &running,
            snapshot: &snapshot,
        });

        let mut report = PassReport::default();

        let preempt = AllocationEvent::Scheduler(SchedulerEvent::Preempt);
        for victim in decision.preemptions {
            match controller.handle(victim, &preempt).await {
                Ok(state) if !state.holds_slots() => report.preempted += 1,
                Ok(_) => {}
                Err(AllocationError::NotFound(_)) => {}
                Err(e) => warn!(allocation_id = %victim, error = %e, "Preemption failed"),
            }
        }

        for placement in decision.placements {
            let allocation_id = placement.allocation_id;
            let assign = AllocationEvent::Scheduler(SchedulerEvent::Assign {
                slots: placement.slots,
            });
            match controller.handle(allocation_id, &assign).await {
                Ok(AllocationState::Assigned) => report.placed += 1,
                Ok(AllocationState::Pending) => {}
                Ok(_) => report.failed_binds += 1,
                Err(AllocationError::BindRejected { source, .. }) => {
                    warn!(%allocation_id, error = %source, "Placement refused by registry");
                    report.failed_binds += 1;
                }
                Err(AllocationError::NotFound(_)) => {
                    pool.remove(&allocation_id);
                }
                Err(e) => warn!(%allocation_id, error = %e, "Placement failed"),
            }
        }

        report.pending = pool.pending_len();
        Ok(report)
    }

    pub fn pool_summaries(&self) -> Vec<PoolSummary> {
        self.inner
            .pools
            .values()
            .map(|pool| {
                let snapshot = self.inner.registry.snapshot(pool.name());
                PoolSummary {
                    name: pool.name().to_string(),
                    policy: pool.policy().name(),
                    pending: pool.pending_len(),
                    max_pending: pool.config().max_pending,
                    gated: pool.is_gated(),
                    agents: snapshot.agents.len(),
                    total_slots: snapshot.total_slots(),
                    free: by_kind_name(snapshot.free_by_kind()),
                    bound: by_kind_name(snapshot.bound_by_kind()),
                }
            })
            .collect()
    }

    // =========================================================================
    // Logs
    // =========================================================================

    pub fn append_logs(
        &self,
        allocation_id: AllocationId,
        entries: Vec<LogEntry>,
    ) -> Result<Vec<Seq>, MasterError> {
        Ok(self.inner.logs.append(allocation_id, entries)?)
    }

    pub fn query_logs(
        &self,
        allocation_id: AllocationId,
        query: &LogQuery,
    ) -> Result<Vec<LogRecord>, MasterError> {
        Ok(self.inner.logs.query(allocation_id, query)?)
    }

    pub fn log_fields(&self, allocation_id: AllocationId) -> Result<LogFields, MasterError> {
        Ok(self.inner.logs.fields(allocation_id)?)
    }

    pub fn follow_logs(
        &self,
        allocation_id: AllocationId,
        query: &LogQuery,
    ) -> Result<ReceiverStream<LogRecord>, MasterError> {
        Ok(self.inner.logs.follow(allocation_id, query)?)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Restore persisted allocations and gate the pools that hold live
    /// ones. Call before agents can connect and before any worker runs;
    /// [`Master::reattach`] then finishes the job.
    pub fn prepare_reattach(&self) -> Result<(), MasterError> {
        Ok(self.inner.reattacher.prepare()?)
    }

    /// Reconcile persisted allocations against live agents, then report
    /// ready.
    pub async fn reattach(&self) -> Result<ReattachReport, MasterError> {
        let report = self.inner.reattacher.run().await?;
        self.inner.ready.store(true, Ordering::SeqCst);
        info!(?report, "Reattachment complete");
        Ok(report)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn health_check(&self) -> Result<(), MasterError> {
        Ok(self.inner.store.health_check()?)
    }

    /// Start the event pump, one scheduler worker per pool, the heartbeat
    /// monitor, and the registry event router.
    pub fn spawn_background(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(tokio::spawn(
            self.inner.controller.clone().run_event_pump(shutdown.clone()),
        ));

        for pool in self.inner.pools.values() {
            let worker =
                SchedulerWorker::new(self.clone(), pool.clone(), self.inner.settings.scheduler_tick);
            handles.push(tokio::spawn(worker.run(shutdown.clone())));
        }

        let monitor = HeartbeatMonitor::new(self.clone(), self.inner.settings.heartbeat_timeout);
        handles.push(tokio::spawn(monitor.run(shutdown.clone())));

        handles.push(tokio::spawn(self.clone().route_registry_events(shutdown.clone())));

        handles
    }

    /// Wake the pools whose capacity a registry change touched.
    async fn route_registry_events(self, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.inner.registry.subscribe();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        for name in event.pools() {
                            if let Some(pool) = self.inner.pools.get(name) {
                                pool.notify();
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Registry event router lagged, waking every pool");
                        for pool in self.inner.pools.values() {
                            pool.notify();
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
