//! Outbound agent RPC.
//!
//! The controller depends only on the narrow [`AgentRpc`] contract: start,
//! stop, and status. [`AgentDispatcher`] runs those calls on spawned tasks
//! with bounded retries so a scheduling pass never waits on an agent, and
//! turns start results back into allocation events.

mod http;
mod mock;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use gantry_events::{AgentEvent, LiveStatus, ResourceSpec, StopMode, TaskType};
use gantry_id::{AgentId, AllocationId, SlotId};
use gantry_reconcile::{BackoffPolicy, RetryTracker, DEFAULT_RETRY_WINDOW};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::allocation::controller::ControllerEvent;

pub use http::HttpAgentRpc;
pub use mock::{MockAgentRpc, RpcCall};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("agent {0} did not answer in time")]
    Timeout(AgentId),

    #[error("agent {agent_id} is unreachable: {message}")]
    Unreachable { agent_id: AgentId, message: String },

    /// The agent answered and refused. Retrying will not help.
    #[error("agent {agent_id} rejected the request: {message}")]
    Rejected { agent_id: AgentId, message: String },
}

impl RpcError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RpcError::Rejected { .. })
    }
}

/// What an agent needs to launch its part of an allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSpec {
    pub allocation_id: AllocationId,
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub resources: ResourceSpec,
    /// Slots on the receiving agent.
    pub slots: Vec<SlotId>,
}

#[async_trait]
pub trait AgentRpc: Send + Sync + 'static {
    async fn start(&self, agent_id: &AgentId, spec: &StartSpec) -> Result<(), RpcError>;

    async fn stop(
        &self,
        agent_id: &AgentId,
        allocation_id: AllocationId,
        mode: StopMode,
    ) -> Result<(), RpcError>;

    async fn status(
        &self,
        agent_id: &AgentId,
        allocation_id: AllocationId,
    ) -> Result<LiveStatus, RpcError>;
}

/// Retries are counted per operation, allocation, and agent.
type RetryKey = (&'static str, AllocationId, AgentId);

fn stop_op(mode: StopMode) -> &'static str {
    match mode {
        StopMode::Graceful => "stop_graceful",
        StopMode::Force => "stop_force",
    }
}

/// Floor for status polling so a zero backoff does not spin.
const MIN_STATUS_INTERVAL: Duration = Duration::from_millis(10);

/// Runs agent commands in the background with bounded retries.
#[derive(Clone)]
pub struct AgentDispatcher {
    rpc: Arc<dyn AgentRpc>,
    events: mpsc::Sender<ControllerEvent>,
    backoff: BackoffPolicy,
    retries: Arc<Mutex<RetryTracker<RetryKey>>>,
}

impl AgentDispatcher {
    /// `max_attempts` counts the first try.
    pub fn new(
        rpc: Arc<dyn AgentRpc>,
        events: mpsc::Sender<ControllerEvent>,
        backoff: BackoffPolicy,
        max_attempts: u32,
    ) -> Self {
        Self {
            rpc,
            events,
            backoff,
            retries: Arc::new(Mutex::new(RetryTracker::new(
                max_attempts.saturating_sub(1),
                DEFAULT_RETRY_WINDOW,
            ))),
        }
    }

    pub fn rpc(&self) -> &Arc<dyn AgentRpc> {
        &self.rpc
    }

    /// Send a start command; the result comes back as `StartAcked` or
    /// `StartFailed`.
    pub fn start(&self, agent_id: AgentId, spec: StartSpec) {
        let this = self.clone();
        tokio::spawn(async move {
            let allocation_id = spec.allocation_id;
            let key = ("start", allocation_id, agent_id);
            let result = this
                .with_retries(key, || {
                    let rpc = this.rpc.clone();
                    let spec = spec.clone();
                    async move { rpc.start(&agent_id, &spec).await }
                })
                .await;

            let event = match result {
                Ok(()) => {
                    debug!(%allocation_id, %agent_id, "Start acknowledged");
                    AgentEvent::StartAcked { agent_id }
                }
                Err(e) => {
                    warn!(%allocation_id, %agent_id, error = %e, "Start failed");
                    AgentEvent::StartFailed {
                        agent_id,
                        message: e.to_string(),
                    }
                }
            };
            this.emit(allocation_id, event).await;
        });
    }

    /// Send a stop command. Failures are logged; the controller's stop
    /// timers decide what happens next.
    pub fn stop(&self, agent_id: AgentId, allocation_id: AllocationId, mode: StopMode) {
        let this = self.clone();
        tokio::spawn(async move {
            let key = (stop_op(mode), allocation_id, agent_id);
            let result = this
                .with_retries(key, || {
                    let rpc = this.rpc.clone();
                    async move { rpc.stop(&agent_id, allocation_id, mode).await }
                })
                .await;
            match result {
                Ok(()) => debug!(%allocation_id, %agent_id, ?mode, "Stop delivered"),
                Err(e) => warn!(%allocation_id, %agent_id, ?mode, error = %e, "Stop not delivered"),
            }
        });
    }

    /// Ask an agent about an allocation, retrying until `timeout` runs out.
    /// `None` means the agent did not answer.
    pub async fn status(
        &self,
        agent_id: AgentId,
        allocation_id: AllocationId,
        timeout: Duration,
    ) -> Option<LiveStatus> {
        let deadline = gantry_reconcile::Deadline::after(timeout);
        let mut attempt = 0;
        loop {
            match tokio::time::timeout(
                deadline.remaining(),
                self.rpc.status(&agent_id, allocation_id),
            )
            .await
            {
                Ok(Ok(status)) => return Some(status),
                Ok(Err(e)) if e.is_retryable() => {
                    debug!(%allocation_id, %agent_id, error = %e, "Status query failed")
                }
                Ok(Err(e)) => {
                    warn!(%allocation_id, %agent_id, error = %e, "Status query rejected");
                    return None;
                }
                Err(_) => return None,
            }

            if deadline.is_expired() {
                return None;
            }
            let delay = self
                .backoff
                .delay(attempt)
                .max(MIN_STATUS_INTERVAL)
                .min(deadline.remaining());
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn with_retries<F, Fut>(&self, key: RetryKey, mut call: F) -> Result<(), RpcError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), RpcError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(()) => {
                    self.tracker().clear(&key);
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    self.tracker().clear(&key);
                    return Err(e);
                }
                Err(e) => {
                    let exhausted = self.tracker().record_failure(key);
                    if exhausted {
                        self.tracker().clear(&key);
                        return Err(e);
                    }
                    let delay = self.backoff.delay(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying agent call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn emit(&self, allocation_id: AllocationId, event: AgentEvent) {
        let message = ControllerEvent {
            allocation_id,
            event: event.into(),
        };
        if self.events.send(message).await.is_err() {
            info!(%allocation_id, "Controller gone, dropping agent result");
        }
    }

    fn tracker(&self) -> std::sync::MutexGuard<'_, RetryTracker<RetryKey>> {
        self.retries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use gantry_events::{AllocationEvent, ResourceSpec};

    use super::*;

    /// Fails the first `failures` calls of every kind.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        reject: bool,
    }

    #[async_trait]
    impl AgentRpc for Flaky {
        async fn start(&self, agent_id: &AgentId, _spec: &StartSpec) -> Result<(), RpcError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reject {
                return Err(RpcError::Rejected {
                    agent_id: *agent_id,
                    message: "no such image".to_string(),
                });
            }
            if n < self.failures {
                return Err(RpcError::Timeout(*agent_id));
            }
            Ok(())
        }

        async fn stop(&self, _: &AgentId, _: AllocationId, _: StopMode) -> Result<(), RpcError> {
            Ok(())
        }

        async fn status(&self, agent_id: &AgentId, _: AllocationId) -> Result<LiveStatus, RpcError> {
            Err(RpcError::Unreachable {
                agent_id: *agent_id,
                message: "connection refused".to_string(),
            })
        }
    }

    fn dispatcher(rpc: Flaky, max_attempts: u32) -> (AgentDispatcher, mpsc::Receiver<ControllerEvent>, Arc<Flaky>) {
        let (tx, rx) = mpsc::channel(16);
        let rpc = Arc::new(rpc);
        let dispatcher = AgentDispatcher::new(rpc.clone(), tx, BackoffPolicy::immediate(), max_attempts);
        (dispatcher, rx, rpc)
    }

    fn spec() -> StartSpec {
        StartSpec {
            allocation_id: AllocationId::new(),
            task_type: TaskType::Command,
            name: None,
            resources: ResourceSpec::gpus(1),
            slots: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_start_retries_then_acks() {
        let (dispatcher, mut rx, rpc) = dispatcher(
            Flaky {
                failures: 2,
                calls: AtomicU32::new(0),
                reject: false,
            },
            5,
        );
        let agent_id = AgentId::new();
        dispatcher.start(agent_id, spec());

        let message = rx.recv().await.unwrap();
        assert_eq!(
            message.event,
            AllocationEvent::Agent(AgentEvent::StartAcked { agent_id })
        );
        assert_eq!(rpc.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_start_gives_up_after_max_attempts() {
        let (dispatcher, mut rx, rpc) = dispatcher(
            Flaky {
                failures: u32::MAX,
                calls: AtomicU32::new(0),
                reject: false,
            },
            3,
        );
        dispatcher.start(AgentId::new(), spec());

        let message = rx.recv().await.unwrap();
        assert!(matches!(
            message.event,
            AllocationEvent::Agent(AgentEvent::StartFailed { .. })
        ));
        assert_eq!(rpc.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let (dispatcher, mut rx, rpc) = dispatcher(
            Flaky {
                failures: 0,
                calls: AtomicU32::new(0),
                reject: true,
            },
            5,
        );
        dispatcher.start(AgentId::new(), spec());

        let message = rx.recv().await.unwrap();
        assert!(matches!(
            message.event,
            AllocationEvent::Agent(AgentEvent::StartFailed { .. })
        ));
        assert_eq!(rpc.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_status_gives_up_at_deadline() {
        let (dispatcher, _rx, _) = dispatcher(
            Flaky {
                failures: 0,
                calls: AtomicU32::new(0),
                reject: false,
            },
            5,
        );
        let status = dispatcher
            .status(AgentId::new(), AllocationId::new(), Duration::from_millis(50))
            .await;
        assert_eq!(status, None);
    }
}
