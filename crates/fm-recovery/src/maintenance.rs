use std::sync::Arc;
use std::time::Duration;

use fm_context::ContextStore;
use fm_core::shutdown::ShutdownSignal;
use fm_queue::JobQueue;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::service::RecoveryService;

/// Periodic timeout patrol, context archive sweep and job pruning.
pub struct MaintenanceLoop {
    recovery: Arc<RecoveryService>,
    context: Arc<ContextStore>,
    interval: Duration,
    archive_after: Duration,
    jobs: Option<(Arc<JobQueue>, Duration)>,
    shutdown: ShutdownSignal,
}

impl MaintenanceLoop {
    pub fn new(
        recovery: Arc<RecoveryService>,
        context: Arc<ContextStore>,
        interval: Duration,
        archive_after: Duration,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            recovery,
            context,
            interval,
            archive_after,
            jobs: None,
            shutdown,
        }
    }

    /// Also drop jobs from `queue` once they have been finished for `retention`.
    pub fn with_job_retention(mut self, queue: Arc<JobQueue>, retention: Duration) -> Self {
        self.jobs = Some((queue, retention));
        self
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let mut stop = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "maintenance loop started");
        loop {
            tokio::select! {
                _ = stop.wait() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
        info!("maintenance loop stopped");
    }

    /// One patrol pass.
    pub async fn tick(&self) {
        let outcomes = self.recovery.check_timeouts().await;
        if !outcomes.is_empty() {
            info!(recovered = outcomes.iter().filter(|o| o.success).count(), total = outcomes.len(), "timed out sessions handled");
        }
        match self.context.archive_old_contexts(self.archive_after).await {
            Ok(0) => debug!("no contexts to archive"),
            Ok(n) => info!(archived = n, "old contexts archived"),
            Err(e) => warn!(error = %e, "context archive sweep failed"),
        }
        if let Some((queue, retention)) = &self.jobs {
            let pruned = queue.prune_finished(*retention);
            if pruned > 0 {
                info!(pruned, remaining = queue.store().len(), "finished jobs pruned");
            }
        }
    }
}
