//! Per-pool scheduler worker.
//!
//! Runs a pass whenever the pool is notified (new request, registry change)
//! and on a periodic tick so a missed notification never stalls the pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::master::Master;
use crate::pool::ResourcePool;

pub struct SchedulerWorker {
    master: Master,
    pool: Arc<ResourcePool>,
    interval: Duration,
}

impl SchedulerWorker {
    pub fn new(master: Master, pool: Arc<ResourcePool>, interval: Duration) -> Self {
        Self {
            master,
            pool,
            interval,
        }
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown), fields(pool = %self.pool.name()))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            policy = self.pool.policy().name(),
            interval_ms = self.interval.as_millis() as u64,
            "Starting scheduler worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.pool.notified() => self.run_pass().await,
                _ = interval.tick() => self.run_pass().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn run_pass(&self) {
        match self.master.schedule_pass(self.pool.name()).await {
            Ok(report) if !report.is_empty() => info!(
                placed = report.placed,
                preempted = report.preempted,
                failed_binds = report.failed_binds,
                pending = report.pending,
                "Scheduling pass complete"
            ),
            Ok(report) if report.gated => debug!("Pool gated during reattachment"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Scheduling pass failed"),
        }
    }
}
