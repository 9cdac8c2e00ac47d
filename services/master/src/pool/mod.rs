//! Resource pools.
//!
//! A pool is a named partition of the agent fleet with its own scheduling
//! policy and a bounded queue of task requests. The queue keeps arrival
//! order; ordering requests is the policy's job.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use gantry_events::{Colocation, DeviceKind, ResourceSpec, TaskType};
use gantry_id::{AgentId, AllocationId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

use crate::config::PoolConfig;
use crate::scheduler::{self, SchedulingPolicy};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("unknown pool: {0}")]
    UnknownPool(String),

    /// No agent ever registered to the pool could satisfy the request.
    #[error("unsatisfiable request: {0}")]
    UnsatisfiableRequest(String),

    #[error("pool {pool} already has {max_pending} pending requests")]
    QueueFull { pool: String, max_pending: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

// =============================================================================
// Task requests
// =============================================================================

/// A request to run one task, as queued in a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub allocation_id: AllocationId,
    pub requester: String,
    pub pool: String,
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub resources: ResourceSpec,
    /// Higher runs first under the priority policy.
    pub priority: i32,
    /// Share weight under the fair-share policy.
    pub weight: f64,
    pub submitted_at: DateTime<Utc>,
}

impl TaskRequest {
    pub fn builder(pool: impl Into<String>) -> TaskRequestBuilder {
        TaskRequestBuilder::new(pool)
    }

    /// Checks that do not depend on the pool.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.resources.slots == 0 {
            return Err(PoolError::UnsatisfiableRequest(
                "a request needs at least one slot".to_string(),
            ));
        }
        if self.requester.trim().is_empty() {
            return Err(PoolError::InvalidRequest(
                "requester must not be empty".to_string(),
            ));
        }
        if !self.weight.is_finite() || self.weight <= 0.0 {
            return Err(PoolError::InvalidRequest(
                "weight must be a positive number".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TaskRequestBuilder {
    pool: String,
    requester: String,
    task_type: TaskType,
    name: Option<String>,
    resources: ResourceSpec,
    priority: i32,
    weight: f64,
    submitted_at: Option<DateTime<Utc>>,
}

impl TaskRequestBuilder {
    fn new(pool: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            requester: "anonymous".to_string(),
            task_type: TaskType::default(),
            name: None,
            resources: ResourceSpec::cpus(1),
            priority: 0,
            weight: 1.0,
            submitted_at: None,
        }
    }

    pub fn requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = requester.into();
        self
    }

    pub fn task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn resources(mut self, resources: ResourceSpec) -> Self {
        self.resources = resources;
        self
    }

    pub fn gpus(self, slots: u32) -> Self {
        self.resources(ResourceSpec::gpus(slots))
    }

    pub fn cpus(self, slots: u32) -> Self {
        self.resources(ResourceSpec::cpus(slots))
    }

    pub fn device(mut self, device: DeviceKind) -> Self {
        self.resources.device = device;
        self
    }

    pub fn spread(mut self) -> Self {
        self.resources.colocation = Colocation::Spread;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn submitted_at(mut self, submitted_at: DateTime<Utc>) -> Self {
        self.submitted_at = Some(submitted_at);
        self
    }

    pub fn build(self) -> TaskRequest {
        TaskRequest {
            allocation_id: AllocationId::new(),
            requester: self.requester,
            pool: self.pool,
            task_type: self.task_type,
            name: self.name,
            resources: self.resources,
            priority: self.priority,
            weight: self.weight,
            submitted_at: self.submitted_at.unwrap_or_else(Utc::now),
        }
    }
}

// =============================================================================
// Pools
// =============================================================================

pub struct ResourcePool {
    config: PoolConfig,
    policy: Box<dyn SchedulingPolicy>,
    queue: Mutex<VecDeque<TaskRequest>>,
    /// Every agent ever registered to the pool, with its slot kinds.
    inventory: RwLock<BTreeMap<AgentId, Vec<DeviceKind>>>,
    notify: Notify,
    gated: AtomicBool,
    pass_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.config.name)
            .field("policy", &self.policy.name())
            .finish_non_exhaustive()
    }
}

impl ResourcePool {
    pub fn new(config: PoolConfig) -> Self {
        let policy = scheduler::policy_for(&config.scheduler);
        Self {
            config,
            policy,
            queue: Mutex::new(VecDeque::new()),
            inventory: RwLock::new(BTreeMap::new()),
            notify: Notify::new(),
            gated: AtomicBool::new(false),
            pass_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn policy(&self) -> &dyn SchedulingPolicy {
        self.policy.as_ref()
    }

    /// Remember an agent's slot kinds for static feasibility checks.
    pub fn record_agent(&self, agent_id: AgentId, slots: Vec<DeviceKind>) {
        self.inventory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent_id, slots);
    }

    /// Whether any agent ever seen could satisfy the requirement.
    pub fn check_feasible(&self, spec: &ResourceSpec) -> Result<(), PoolError> {
        let inventory = self.inventory.read().unwrap_or_else(PoisonError::into_inner);
        let want = spec.slots as usize;
        let per_agent = inventory
            .values()
            .map(|slots| slots.iter().filter(|d| d.satisfies(&spec.device)).count());

        let feasible = match spec.colocation {
            Colocation::SingleAgent => per_agent.max().unwrap_or(0) >= want,
            Colocation::Spread => per_agent.sum::<usize>() >= want,
        };

        if feasible {
            Ok(())
        } else {
            Err(PoolError::UnsatisfiableRequest(format!(
                "pool {} has never had {} {} slot(s) {}",
                self.config.name,
                spec.slots,
                spec.device,
                match spec.colocation {
                    Colocation::SingleAgent => "on one agent",
                    Colocation::Spread => "in total",
                }
            )))
        }
    }

    /// Everything short of queueing: request validity, feasibility, room.
    pub fn check_admission(&self, request: &TaskRequest) -> Result<(), PoolError> {
        request.validate()?;
        self.check_feasible(&request.resources)?;
        if self.queue().len() >= self.config.max_pending {
            return Err(self.queue_full());
        }
        Ok(())
    }

    /// Append an admitted request and wake the pool's worker.
    pub fn enqueue(&self, request: TaskRequest) -> Result<(), PoolError> {
        {
            let mut queue = self.queue();
            if queue.len() >= self.config.max_pending {
                return Err(self.queue_full());
            }
            queue.push_back(request);
        }
        self.notify();
        Ok(())
    }

    /// Put back a request recovered from storage. Skips the bound check.
    pub fn requeue(&self, request: TaskRequest) {
        let mut queue = self.queue();
        if queue.iter().all(|r| r.allocation_id != request.allocation_id) {
            queue.push_back(request);
        }
    }

    pub fn remove(&self, allocation_id: &AllocationId) -> Option<TaskRequest> {
        let mut queue = self.queue();
        let index = queue
            .iter()
            .position(|r| r.allocation_id == *allocation_id)?;
        queue.remove(index)
    }

    /// Pending requests in arrival order.
    pub fn pending(&self) -> Vec<TaskRequest> {
        self.queue().iter().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.queue().len()
    }

    pub fn notify(&self) {
        self.notify.notify_one();
    }

    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Hold back scheduling until reattachment finishes.
    pub fn set_gated(&self, gated: bool) {
        self.gated.store(gated, Ordering::SeqCst);
        if !gated {
            self.notify();
        }
    }

    pub fn is_gated(&self) -> bool {
        self.gated.load(Ordering::SeqCst)
    }

    /// Serializes passes for this pool.
    pub async fn lock_pass(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.pass_lock.lock().await
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<TaskRequest>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue_full(&self) -> PoolError {
        PoolError::QueueFull {
            pool: self.config.name.clone(),
            max_pending: self.config.max_pending,
        }
    }
}
