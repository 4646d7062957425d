use std::sync::Arc;

use fm_agents::{AgentService, InMemoryAgentRepository, ProcessRunner, RunnerRegistry};
use fm_context::{ContextStore, FsArchive, MemoryCache, SqliteRecentStore};
use fm_core::config::Config;
use fm_core::event_bus::EventBus;
use fm_core::shutdown::ShutdownSignal;
use fm_core::types::AgentType;
use fm_queue::{JobProcessor, JobQueue, QueueSettings, WorkerPool};
use fm_recovery::{
    CheckpointStore, FailureDetector, MaintenanceLoop, QueueSessionRuntime, RecoveryCoordinator,
    RecoveryHistoryStore, RecoveryService,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dispatch::QueueDispatch;
use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::registry::WorkflowRegistry;

/// A fully wired foreman: storage, queue, recovery and orchestrator sharing
/// one event bus and one shutdown signal.
///
/// Construction opens storage but starts nothing; call [`start`](Foreman::start)
/// to launch the worker pool and the maintenance loop.
pub struct Foreman {
    config: Config,
    bus: EventBus,
    shutdown: ShutdownSignal,
    queue: Arc<JobQueue>,
    processor: Arc<JobProcessor>,
    agents: AgentService,
    context: Arc<ContextStore>,
    registry: Arc<WorkflowRegistry>,
    recovery: Arc<RecoveryService>,
    orchestrator: Arc<Orchestrator>,
}

impl Foreman {
    /// Open with one [`ProcessRunner`] per agent type configured under
    /// `[runners]`.
    pub async fn open(config: Config) -> Result<Self> {
        let runners = runners_from_config(&config);
        Self::open_with_runners(config, runners).await
    }

    pub async fn open_with_runners(config: Config, runners: RunnerRegistry) -> Result<Self> {
        if let Some(parent) = config.storage.db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::create_dir_all(&config.storage.archive_dir).await?;

        // Context snapshots, checkpoints and recovery history share one
        // database file.
        let conn = tokio_rusqlite::Connection::open(&config.storage.db_path).await?;
        let recent = SqliteRecentStore::from_connection(conn.clone()).await?;
        let checkpoints = CheckpointStore::from_connection(conn.clone()).await?;
        let history = RecoveryHistoryStore::from_connection(conn).await?;

        let bus = EventBus::new();
        let shutdown = ShutdownSignal::new();
        let context = Arc::new(ContextStore::new(
            Arc::new(MemoryCache::new(config.context.cache_capacity)),
            Arc::new(recent),
            Arc::new(FsArchive::new(&config.storage.archive_dir)),
            &config.context,
        ));

        let agents = AgentService::new(Arc::new(InMemoryAgentRepository::new()));
        let queue = Arc::new(JobQueue::new(QueueSettings::from(&config.queue)));
        let registry = Arc::new(WorkflowRegistry::new(
            config.workflow.max_workflows,
            bus.clone(),
        ));
        let processor = Arc::new(JobProcessor::new(
            queue.store(),
            agents.clone(),
            runners,
            Arc::clone(&context),
            registry.clone(),
            bus.clone(),
        ));

        let detector = Arc::new(FailureDetector::new(&config.failure, bus.clone()));
        let coordinator = RecoveryCoordinator::new(
            checkpoints,
            history,
            Arc::new(QueueSessionRuntime::new(Arc::clone(&queue), Arc::clone(&context))),
            registry.clone(),
            bus.clone(),
            &config.failure,
        );
        let recovery = Arc::new(RecoveryService::new(detector, coordinator));

        let orchestrator = Arc::new(Orchestrator::new(
            QueueDispatch::new(Arc::clone(&queue)),
            agents.clone(),
            Arc::clone(&context),
            Arc::clone(&registry),
            recovery.clone(),
            &config.workflow,
        ));

        info!(db = %config.storage.db_path.display(), workers = config.queue.workers, "foreman opened");
        Ok(Self {
            config,
            bus,
            shutdown,
            queue,
            processor,
            agents,
            context,
            registry,
            recovery,
            orchestrator,
        })
    }

    /// Launch the worker pool and the maintenance loop.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let pool = WorkerPool::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.processor),
            self.config.queue.workers,
            self.shutdown.clone(),
        );
        vec![pool.start(), self.maintenance().start()]
    }

    /// The periodic patrol that [`start`](Foreman::start) runs in the
    /// background. A single pass can be forced with [`MaintenanceLoop::tick`].
    pub fn maintenance(&self) -> MaintenanceLoop {
        MaintenanceLoop::new(
            Arc::clone(&self.recovery),
            Arc::clone(&self.context),
            self.config.failure.check_interval(),
            self.config.context.archive_after(),
            self.shutdown.clone(),
        )
        .with_job_retention(Arc::clone(&self.queue), self.config.queue.job_retention())
    }

    /// Trigger shutdown and wait for the tasks returned by [`start`](Foreman::start).
    pub async fn shutdown(&self, handles: Vec<JoinHandle<()>>) {
        if !self.shutdown.is_shutting_down() {
            self.shutdown.trigger();
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("foreman stopped");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn agents(&self) -> &AgentService {
        &self.agents
    }

    pub fn context(&self) -> &Arc<ContextStore> {
        &self.context
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    pub fn recovery(&self) -> &Arc<RecoveryService> {
        &self.recovery
    }
}

fn runners_from_config(config: &Config) -> RunnerRegistry {
    let mut runners = RunnerRegistry::new();
    for agent_type in AgentType::ALL {
        match config.runner_for(agent_type) {
            Some(cfg) => {
                info!(%agent_type, command = %cfg.command, "runner configured");
                runners.register(agent_type, Arc::new(ProcessRunner::from_config(cfg)));
            }
            None => warn!(%agent_type, "no runner configured, tasks for this agent type will fail"),
        }
    }
    runners
}
