//! Heartbeat monitor.
//!
//! Sweeps the registry for agents that stopped heartbeating. Expired agents
//! are marked disconnected and their allocations fail over as lost.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::master::Master;

/// Sweeps run this many times per heartbeat timeout.
const SWEEPS_PER_TIMEOUT: u32 = 4;

/// Lower bound on the sweep interval.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

pub struct HeartbeatMonitor {
    master: Master,
    interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(master: Master, timeout: Duration) -> Self {
        Self {
            master,
            interval: sweep_interval(timeout),
        }
    }

    /// Run until shutdown is signaled.
    #[instrument(skip_all)]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting heartbeat monitor"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let expired = self.master.expire_heartbeats().await;
                    if expired > 0 {
                        warn!(expired, "Agents disconnected after missing heartbeats");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Heartbeat monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}

fn sweep_interval(timeout: Duration) -> Duration {
    (timeout / SWEEPS_PER_TIMEOUT).max(MIN_SWEEP_INTERVAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_interval_divides_timeout() {
        assert_eq!(sweep_interval(Duration::from_secs(30)), Duration::from_millis(7500));
    }

    #[test]
    fn test_sweep_interval_has_floor() {
        assert_eq!(sweep_interval(Duration::from_millis(20)), MIN_SWEEP_INTERVAL);
    }
}
