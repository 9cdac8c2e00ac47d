//! Master restarts: persisted allocations are reconciled against agents.

mod common;

use std::time::Duration;

use common::{gpus, start_with, test_settings, Harness};
use gantry_events::{AllocationState, LiveStatus, StopMode, TerminatingReason};
use gantry_id::{AgentId, AllocationId};
use gantry_master::config::PoolConfig;
use gantry_master::db::Store;
use gantry_master::pool::TaskRequest;

fn pools() -> Vec<PoolConfig> {
    vec![PoolConfig::named("compute")]
}

/// First life of the master: one agent running one allocation.
async fn running_allocation(store: &Store) -> (AgentId, AllocationId) {
    let h = start_with(store.clone(), pools(), test_settings());
    let agent = h.add_agent("compute", gpus(2)).await;
    let alloc = h
        .master
        .submit(TaskRequest::builder("compute").gpus(2).build())
        .await
        .unwrap();
    h.master.schedule_pass("compute").await.unwrap();
    h.wait_for_state(alloc.id, AllocationState::Starting).await;
    h.master.mark_ready(alloc.id).await.unwrap();
    (agent, alloc.id)
}

async fn wait_until_restored(h: &Harness, allocation_id: AllocationId) {
    for _ in 0..200 {
        if h.master.controller().is_active(&allocation_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("allocation {allocation_id} was never restored");
}

#[tokio::test]
async fn returning_agent_resumes_its_allocation() {
    let store = Store::open_in_memory().unwrap();
    let (agent, alloc) = running_allocation(&store).await;
    let history_before = store.load_history(&alloc).unwrap().len();

    let h = start_with(store.clone(), pools(), test_settings());
    h.rpc.set_status(agent, alloc, LiveStatus::Running);

    let reattach = tokio::spawn({
        let master = h.master.clone();
        async move { master.reattach().await }
    });
    wait_until_restored(&h, alloc).await;
    assert!(h.master.pool("compute").unwrap().is_gated());
    h.connect(agent, "compute", gpus(2), &[alloc]).await;

    let report = reattach.await.unwrap().unwrap();
    assert_eq!(report.resumed, 1);
    assert!(h.master.is_ready());
    assert!(!h.master.pool("compute").unwrap().is_gated());

    assert_eq!(h.state(alloc).await, AllocationState::Running);
    assert_eq!(h.master.registry().slots_of(&alloc).len(), 2);
    assert_eq!(store.load_history(&alloc).unwrap().len(), history_before);
    assert!(h.rpc.stops().is_empty());
}

#[tokio::test]
async fn early_handshake_neither_kills_nor_double_places() {
    let store = Store::open_in_memory().unwrap();
    let (agent, alloc) = running_allocation(&store).await;

    let h = start_with(store.clone(), pools(), test_settings());
    h.master.prepare_reattach().unwrap();
    h.rpc.set_status(agent, alloc, LiveStatus::Running);

    // The agent comes back before the reconciler has asked anyone.
    h.connect(agent, "compute", gpus(2), &[alloc]).await;
    let intruder = h
        .master
        .submit(TaskRequest::builder("compute").gpus(2).build())
        .await
        .unwrap();
    let pass = h.master.schedule_pass("compute").await.unwrap();
    assert!(pass.gated);
    assert_eq!(pass.placed, 0);

    let report = h.master.reattach().await.unwrap();
    assert_eq!(report.resumed, 1);
    assert_eq!(report.settled, 0);

    assert_eq!(h.state(alloc).await, AllocationState::Running);
    assert_eq!(h.master.registry().slots_of(&alloc).len(), 2);
    assert!(h.rpc.stops().is_empty());

    let pass = h.master.schedule_pass("compute").await.unwrap();
    assert_eq!(pass.placed, 0);
    assert_eq!(h.state(intruder.id).await, AllocationState::Pending);
    assert!(h.master.registry().slots_of(&intruder.id).is_empty());
}

#[tokio::test]
async fn replaying_reconciliation_changes_nothing() {
    let store = Store::open_in_memory().unwrap();
    let (agent, alloc) = running_allocation(&store).await;

    let h = start_with(store.clone(), pools(), test_settings());
    h.rpc.set_status(agent, alloc, LiveStatus::Running);
    let reattach = tokio::spawn({
        let master = h.master.clone();
        async move { master.reattach().await }
    });
    wait_until_restored(&h, alloc).await;
    h.connect(agent, "compute", gpus(2), &[alloc]).await;
    reattach.await.unwrap().unwrap();

    let version = h.master.registry().version();
    let history = store.load_history(&alloc).unwrap().len();

    let report = h.master.reattach().await.unwrap();
    assert_eq!(report.resumed, 1);
    assert_eq!(h.master.registry().version(), version);
    assert_eq!(store.load_history(&alloc).unwrap().len(), history);
    assert_eq!(h.state(alloc).await, AllocationState::Running);
}

#[tokio::test]
async fn missing_agent_tears_allocation_down_after_grace() {
    let store = Store::open_in_memory().unwrap();
    let (agent, alloc) = running_allocation(&store).await;

    let h = start_with(store.clone(), pools(), test_settings());
    let report = h.master.reattach().await.unwrap();
    assert_eq!(report.torn_down, 1);

    assert_eq!(
        h.state(alloc).await,
        AllocationState::Terminating {
            reason: TerminatingReason::AgentLost
        }
    );
    assert!(!h.master.pool("compute").unwrap().is_gated());

    for _ in 0..200 {
        if !h.rpc.stops().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.rpc.stops(), vec![(agent, alloc, StopMode::Graceful)]);
}

#[tokio::test]
async fn pending_requests_survive_restart() {
    let store = Store::open_in_memory().unwrap();
    let (agent, pending) = {
        let h = start_with(store.clone(), pools(), test_settings());
        let agent = h.add_agent("compute", gpus(1)).await;
        h.master.drain(&agent).unwrap();
        let alloc = h
            .master
            .submit(TaskRequest::builder("compute").gpus(1).build())
            .await
            .unwrap();
        (agent, alloc.id)
    };

    let h = start_with(store.clone(), pools(), test_settings());
    let report = h.master.reattach().await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(h.master.pool("compute").unwrap().pending_len(), 1);

    h.connect(agent, "compute", gpus(1), &[]).await;
    let pass = h.master.schedule_pass("compute").await.unwrap();
    assert_eq!(pass.placed, 1);
    assert_eq!(h.master.registry().slots_of(&pending).len(), 1);
}

#[tokio::test]
async fn orphaned_allocation_is_force_stopped_on_handshake() {
    let h = start_with(Store::open_in_memory().unwrap(), pools(), test_settings());
    h.master.reattach().await.unwrap();

    let agent = AgentId::new();
    let orphan = AllocationId::new();
    h.connect(agent, "compute", gpus(1), &[orphan]).await;

    for _ in 0..200 {
        if !h.rpc.stops().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.rpc.stops(), vec![(agent, orphan, StopMode::Force)]);
}
