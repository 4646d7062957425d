use std::sync::Arc;

use fm_core::shutdown::ShutdownSignal;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

use crate::processor::JobProcessor;
use crate::queue::{Delivery, JobQueue};

/// Default worker count when none is specified.
const DEFAULT_WORKERS: usize = 10;

/// Drains the queue with at most `workers` jobs in flight.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    processor: Arc<JobProcessor>,
    gate: Arc<Semaphore>,
    workers: usize,
    shutdown: ShutdownSignal,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<JobQueue>,
        processor: Arc<JobProcessor>,
        workers: usize,
        shutdown: ShutdownSignal,
    ) -> Self {
        let workers = if workers == 0 {
            warn!("workers was 0, defaulting to {DEFAULT_WORKERS}");
            DEFAULT_WORKERS
        } else {
            workers
        };
        Self {
            queue,
            processor,
            gate: Arc::new(Semaphore::new(workers)),
            workers,
            shutdown,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn available_slots(&self) -> usize {
        self.gate.available_permits()
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Pull deliveries until shutdown, then wait for in-flight jobs.
    pub async fn run(self) {
        let deliveries = self.queue.deliveries();
        let mut stop = self.shutdown.subscribe();
        let mut in_flight = JoinSet::new();
        info!(workers = self.workers, "worker pool started");

        loop {
            let permit = tokio::select! {
                _ = stop.wait() => break,
                permit = Arc::clone(&self.gate).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let delivery = tokio::select! {
                _ = stop.wait() => break,
                next = deliveries.recv_async() => match next {
                    Ok(delivery) => delivery,
                    Err(_) => break,
                },
            };

            let guard = self.shutdown.guard();
            let queue = Arc::clone(&self.queue);
            let processor = Arc::clone(&self.processor);
            let shutdown = self.shutdown.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                handle(&queue, &processor, &shutdown, delivery).await;
            });

            while let Some(done) = in_flight.try_join_next() {
                if let Err(e) = done {
                    warn!(error = %e, "worker task panicked");
                }
            }
        }

        info!(in_flight = in_flight.len(), "worker pool stopping");
        while let Some(done) = in_flight.join_next().await {
            if let Err(e) = done {
                warn!(error = %e, "worker task panicked");
            }
        }
        info!("worker pool stopped");
    }
}

async fn handle(
    queue: &JobQueue,
    processor: &JobProcessor,
    shutdown: &ShutdownSignal,
    delivery: Delivery,
) {
    if let Err(e) = processor.process(delivery).await {
        processor.on_failed(delivery, &e).await;
        if queue.retry_later(delivery, shutdown) {
            info!(job_id = %delivery.job_id, attempt = delivery.attempt, "job will be retried");
        }
    }
}
