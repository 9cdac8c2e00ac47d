//! Shared harness for master integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use gantry_events::{AllocationState, DeviceKind};
use gantry_id::{AgentId, AllocationId};
use gantry_master::agent::MockAgentRpc;
use gantry_master::config::{MasterSettings, PoolConfig};
use gantry_master::db::Store;
use gantry_master::registry::{AgentRegistration, Registry};
use gantry_master::Master;
use gantry_reconcile::BackoffPolicy;
use tokio::sync::watch;

pub struct Harness {
    pub master: Master,
    pub rpc: Arc<MockAgentRpc>,
    pub store: Store,
    shutdown: watch::Sender<bool>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,gantry_master=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Settings that keep tests quick without racing the assertions.
pub fn test_settings() -> MasterSettings {
    MasterSettings {
        rpc_backoff: BackoffPolicy::immediate(),
        reattach_grace: Duration::from_millis(300),
        ..MasterSettings::default()
    }
}

/// A master over `store` with its event pump running. Scheduling passes
/// are driven by the test.
pub fn start_with(store: Store, pools: Vec<PoolConfig>, settings: MasterSettings) -> Harness {
    init_tracing();
    let rpc = Arc::new(MockAgentRpc::new());
    let master = Master::new(
        store.clone(),
        Arc::new(Registry::new()),
        rpc.clone(),
        pools,
        settings,
    )
    .unwrap();

    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(master.controller().clone().run_event_pump(shutdown_rx));

    Harness {
        master,
        rpc,
        store,
        shutdown,
    }
}

pub fn start(pools: Vec<PoolConfig>) -> Harness {
    start_with(Store::open_in_memory().unwrap(), pools, test_settings())
}

impl Harness {
    pub async fn add_agent(&self, pool: &str, slots: Vec<DeviceKind>) -> AgentId {
        let agent_id = AgentId::new();
        self.connect(agent_id, pool, slots, &[]).await;
        agent_id
    }

    pub async fn connect(
        &self,
        agent_id: AgentId,
        pool: &str,
        slots: Vec<DeviceKind>,
        running: &[AllocationId],
    ) {
        self.master
            .register_agent(
                AgentRegistration {
                    agent_id,
                    pool: pool.to_string(),
                    labels: BTreeMap::new(),
                    rpc_url: None,
                    slots,
                },
                running,
            )
            .await
            .unwrap();
    }

    pub async fn state(&self, allocation_id: AllocationId) -> AllocationState {
        self.master.get(allocation_id).await.unwrap().allocation.state
    }

    pub async fn wait_for_state(&self, allocation_id: AllocationId, state: AllocationState) {
        for _ in 0..400 {
            if self.state(allocation_id).await == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "allocation {allocation_id} stuck in {}, expected {state}",
            self.state(allocation_id).await
        );
    }

    /// Free slots of one kind in a pool.
    pub fn free(&self, pool: &str, kind: &str) -> usize {
        self.master
            .pool_summaries()
            .into_iter()
            .find(|p| p.name == pool)
            .and_then(|p| p.free.get(kind).copied())
            .unwrap_or(0)
    }
}

pub fn gpus(n: usize) -> Vec<DeviceKind> {
    vec![DeviceKind::gpu(); n]
}
