use std::sync::Arc;
use std::time::Duration;

use fm_core::config::QueueConfig;
use fm_core::shutdown::ShutdownSignal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::job::{Job, JobCounts, JobSpec, JobStatus};
use crate::store::JobStore;

/// One delivery of a job to a worker. `attempt` is 1-based and owned by the
/// queue runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: Uuid,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for QueueSettings {
    fn from(cfg: &QueueConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            backoff_max: Duration::from_millis(cfg.backoff_max_ms),
        }
    }
}

impl QueueSettings {
    /// Delay before delivering attempt `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

/// In-process queue runtime with at-least-once delivery.
pub struct JobQueue {
    store: Arc<JobStore>,
    tx: flume::Sender<Delivery>,
    rx: flume::Receiver<Delivery>,
    settings: QueueSettings,
}

impl JobQueue {
    pub fn new(settings: QueueSettings) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            store: Arc::new(JobStore::new()),
            tx,
            rx,
            settings,
        }
    }

    pub fn settings(&self) -> QueueSettings {
        self.settings
    }

    pub fn store(&self) -> Arc<JobStore> {
        Arc::clone(&self.store)
    }

    pub(crate) fn deliveries(&self) -> flume::Receiver<Delivery> {
        self.rx.clone()
    }

    /// Enqueue a job and return its id without waiting for it to run.
    pub fn add_job(&self, spec: JobSpec) -> Uuid {
        let job = Job::from_spec(spec, self.settings.max_attempts);
        let id = job.id;
        info!(job_id = %id, job_type = %job.job_type, agent_id = %job.payload.agent_id, "job queued");
        self.store.insert(job);
        self.deliver(Delivery {
            job_id: id,
            attempt: 1,
        });
        id
    }

    /// Schedule the next attempt after a failed delivery. Returns `false`
    /// when the job's attempt budget is spent.
    ///
    /// A redelivery still waiting out its backoff when shutdown is triggered
    /// is abandoned and the job is failed, so nothing waits on it forever.
    pub fn retry_later(&self, failed: Delivery, shutdown: &ShutdownSignal) -> bool {
        let max = self
            .store
            .get(failed.job_id)
            .map(|job| job.max_attempts)
            .unwrap_or(self.settings.max_attempts);
        if failed.attempt >= max {
            return false;
        }
        let delay = self.settings.backoff(failed.attempt);
        let next = Delivery {
            job_id: failed.job_id,
            attempt: failed.attempt + 1,
        };
        debug!(job_id = %next.job_id, attempt = next.attempt, delay_ms = delay.as_millis() as u64, "redelivery scheduled");
        let tx = self.tx.clone();
        let store = Arc::clone(&self.store);
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.wait() => {
                    warn!(job_id = %next.job_id, attempt = next.attempt, "shutdown before redelivery, failing job");
                    store.update(next.job_id, |job| {
                        job.status = JobStatus::Failed;
                        job.error = Some(format!(
                            "shut down before attempt {} could run",
                            next.attempt
                        ));
                        job.finished_at = Some(chrono::Utc::now());
                    });
                }
                _ = tokio::time::sleep(delay) => {
                    if tx.send(next).is_err() {
                        warn!(job_id = %next.job_id, attempt = next.attempt, "queue closed, redelivery dropped");
                    }
                }
            }
        });
        true
    }

    fn deliver(&self, delivery: Delivery) {
        // The queue owns both ends of the channel, so send cannot fail.
        let _ = self.tx.send(delivery);
    }

    /// Forget jobs that finished at least `older_than` ago.
    pub fn prune_finished(&self, older_than: Duration) -> usize {
        let pruned = self.store.prune_finished(older_than);
        if pruned > 0 {
            debug!(pruned, "finished jobs pruned");
        }
        pruned
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    // -- Status queries -----------------------------------------------------

    pub fn get_job(&self, id: Uuid) -> Option<Job> {
        self.store.get(id)
    }

    pub fn list_jobs(&self, status: Option<JobStatus>) -> Vec<Job> {
        self.store.list(status)
    }

    pub fn counts(&self) -> JobCounts {
        self.store.counts()
    }

    pub async fn wait_for_terminal(&self, id: Uuid) -> Result<Job> {
        self.store.wait_for_terminal(id).await
    }
}
