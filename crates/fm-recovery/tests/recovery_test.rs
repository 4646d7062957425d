use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fm_agents::{AgentService, AgentStatus, InMemoryAgentRepository, RunnerRegistry};
use fm_context::{ContextStore, FsArchive, MemoryCache, SqliteRecentStore};
use fm_core::config::{ContextConfig, FailureConfig};
use fm_core::event_bus::EventBus;
use fm_core::shutdown::ShutdownSignal;
use fm_core::types::{AgentType, FailureType, WorkflowPhase};
use fm_queue::{JobProcessor, JobQueue, NoopHooks, QueueSettings, WorkerPool};
use fm_recovery::{
    Checkpoint, CheckpointStore, FailureDetector, FailureRecovery, ManualAction,
    PipelineControl, QueueSessionRuntime, RecoveryCoordinator, RecoveryError,
    RecoveryHistoryStore, RecoveryService, RecoveryStrategy, SessionInfo, SessionRuntime,
};
use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Doubles
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptedRuntime {
    terminated: Mutex<Vec<Uuid>>,
    restarts: Mutex<Vec<(AgentType, Option<String>)>>,
    refreshes: AtomicUsize,
    /// Number of upcoming restarts that fail.
    fail_restarts: AtomicUsize,
    /// When set, the next restart blocks until notified.
    hold_restart: Mutex<Option<Arc<Notify>>>,
}

#[async_trait]
impl SessionRuntime for ScriptedRuntime {
    async fn terminate(&self, session: &SessionInfo) -> fm_recovery::Result<()> {
        self.terminated.lock().unwrap().push(session.agent_id);
        Ok(())
    }

    async fn restart(
        &self,
        session: &SessionInfo,
        agent_type: AgentType,
        checkpoint: Option<&Checkpoint>,
    ) -> fm_recovery::Result<SessionInfo> {
        let gate = self.hold_restart.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let pending = self.fail_restarts.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_restarts.store(pending - 1, Ordering::SeqCst);
            return Err(RecoveryError::Runtime("spawn refused".into()));
        }
        self.restarts
            .lock()
            .unwrap()
            .push((agent_type, checkpoint.and_then(|cp| cp.revision.clone())));
        Ok(SessionInfo {
            agent_id: Uuid::new_v4(),
            agent_type,
            ..session.clone()
        })
    }

    async fn refresh_context(&self, _: &SessionInfo, _: &SessionInfo) -> fm_recovery::Result<bool> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

#[derive(Default)]
struct RecordingPipeline {
    paused: Mutex<Vec<(Uuid, String)>>,
    failed: Mutex<Vec<(Uuid, String)>>,
}

#[async_trait]
impl PipelineControl for RecordingPipeline {
    async fn pause(&self, workflow_id: Uuid, reason: &str) -> fm_recovery::Result<()> {
        self.paused.lock().unwrap().push((workflow_id, reason.to_string()));
        Ok(())
    }

    async fn fail(&self, workflow_id: Uuid, reason: &str) -> fm_recovery::Result<()> {
        self.failed.lock().unwrap().push((workflow_id, reason.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    service: RecoveryService,
    runtime: Arc<ScriptedRuntime>,
    pipeline: Arc<RecordingPipeline>,
    events: flume::Receiver<fm_core::events::Event>,
    workflow_id: Uuid,
}

async fn harness(cfg: FailureConfig) -> Harness {
    let bus = EventBus::new();
    let events = bus.subscribe();
    let runtime = Arc::new(ScriptedRuntime::default());
    let pipeline = Arc::new(RecordingPipeline::default());
    let coordinator = RecoveryCoordinator::new(
        CheckpointStore::open_in_memory().await.unwrap(),
        RecoveryHistoryStore::open_in_memory().await.unwrap(),
        runtime.clone(),
        pipeline.clone(),
        bus.clone(),
        &cfg,
    );
    let detector = Arc::new(FailureDetector::new(&cfg, bus));
    Harness {
        service: RecoveryService::new(detector, coordinator),
        runtime,
        pipeline,
        events,
        workflow_id: Uuid::new_v4(),
    }
}

impl Harness {
    async fn register(&self, session_id: &str) -> SessionInfo {
        let session = SessionInfo {
            session_id: session_id.to_string(),
            agent_id: Uuid::new_v4(),
            agent_type: AgentType::Dev,
            tenant_id: "acme".into(),
            workflow_id: Some(self.workflow_id),
            task_id: Some(Uuid::new_v4()),
            phase: Some(WorkflowPhase::Implementation),
        };
        self.service.register_session(session.clone()).await;
        session
    }

    fn event_names(&self) -> Vec<&'static str> {
        self.events.try_iter().map(|e| e.name()).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_crash_recovery_retries_from_checkpoint() {
    let h = harness(FailureConfig::default()).await;
    let session = h.register("wf/implementation").await;
    let mut cp = Checkpoint::new(&session);
    cp.revision = Some("9f1c2e".into());
    cp.branch = Some("fix/login".into());
    h.service.record_checkpoint(cp.clone()).await;

    let outcome = h
        .service
        .on_process_exit(&session.session_id, Some(1), None)
        .await
        .unwrap();

    assert_eq!(outcome.strategy, RecoveryStrategy::RetryFromCheckpoint);
    assert!(outcome.success);
    assert_eq!(outcome.attempt, 1);
    let replacement = outcome.replacement_agent().unwrap();
    assert_ne!(replacement, session.agent_id);
    assert_eq!(*h.runtime.terminated.lock().unwrap(), vec![session.agent_id]);
    assert_eq!(
        *h.runtime.restarts.lock().unwrap(),
        vec![(AgentType::Dev, Some("9f1c2e".to_string()))]
    );

    // Resolved, and the session now follows the replacement agent.
    assert!(h.service.get_active_failures(None).is_empty());
    assert_eq!(
        h.service.detector().session(&session.session_id).unwrap().agent_id,
        replacement
    );

    let status = h.service.get_recovery_status(&session.session_id).await.unwrap();
    assert_eq!(status.automatic_attempts, 1);
    assert_eq!(status.history[0].checkpoint_id, Some(cp.id));
    assert!(!status.escalated);

    let names = h.event_names();
    assert!(names.contains(&"failure.detected"));
    assert!(names.contains(&"recovery.attempted"));
}

#[tokio::test]
async fn fourth_failure_on_a_session_escalates() {
    let h = harness(FailureConfig::default()).await;
    let session = h.register("wf/qa").await;

    let mut strategies = Vec::new();
    let mut last = None;
    for _ in 0..4 {
        let outcome = h
            .service
            .on_process_exit(&session.session_id, Some(2), None)
            .await
            .unwrap();
        strategies.push(outcome.strategy);
        last = Some(outcome);
    }

    assert_eq!(
        strategies,
        vec![
            RecoveryStrategy::RetryFromCheckpoint,
            RecoveryStrategy::RetryFromCheckpoint,
            RecoveryStrategy::ContextRefreshRetry,
            RecoveryStrategy::Escalation,
        ]
    );
    let last = last.unwrap();
    assert!(last.escalated());
    assert!(!last.success);
    assert_eq!(last.attempt, 4);

    let paused = h.pipeline.paused.lock().unwrap().clone();
    assert_eq!(paused.len(), 1);
    assert_eq!(paused[0].0, h.workflow_id);
    assert_eq!(h.runtime.refreshes.load(Ordering::SeqCst), 1);

    // The escalated failure stays open for a human.
    let open = h.service.get_active_failures(Some(&session.session_id));
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, last.failure_id);

    let status = h.service.get_recovery_status(&session.session_id).await.unwrap();
    assert!(status.escalated);
    assert_eq!(status.history.len(), 4);
    assert_eq!(status.last_strategy, Some(RecoveryStrategy::Escalation));
    assert!(h.event_names().contains(&"recovery.escalated"));
}

#[tokio::test]
async fn loop_failures_refresh_context() {
    let cfg = FailureConfig {
        loop_threshold: 3,
        ..FailureConfig::default()
    };
    let h = harness(cfg).await;
    let session = h.register("wf/implementation").await;

    assert!(h.service.on_file_modified(&session.session_id, "src/a.rs").await.is_none());
    assert!(h.service.on_file_modified(&session.session_id, "src/a.rs").await.is_none());
    let outcome = h
        .service
        .on_file_modified(&session.session_id, "src/a.rs")
        .await
        .unwrap();

    assert_eq!(outcome.strategy, RecoveryStrategy::ContextRefreshRetry);
    assert!(outcome.success);
    assert_eq!(h.runtime.refreshes.load(Ordering::SeqCst), 1);
    let history = h.service.get_recovery_status(&session.session_id).await.unwrap().history;
    assert_eq!(history[0].failure_type, FailureType::Loop);
}

#[tokio::test]
async fn failed_attempts_are_recorded_and_stay_open() {
    let h = harness(FailureConfig::default()).await;
    let session = h.register("wf/implementation").await;
    h.runtime.fail_restarts.store(1, Ordering::SeqCst);

    let outcome = h
        .service
        .on_stall(&session.session_id, "no output for 10 minutes")
        .await
        .unwrap();

    assert!(!outcome.success);
    assert!(outcome.message.contains("spawn refused"));
    assert_eq!(h.service.get_active_failures(None).len(), 1);
    let status = h.service.get_recovery_status(&session.session_id).await.unwrap();
    assert_eq!(status.history.len(), 1);
    assert!(!status.history[0].success);
    assert_eq!(status.automatic_attempts, 1);
}

#[tokio::test]
async fn manual_terminate_fails_the_pipeline() {
    let h = harness(FailureConfig::default()).await;
    let session = h.register("wf/deployment").await;
    h.runtime.fail_restarts.store(1, Ordering::SeqCst);
    let failed = h
        .service
        .on_process_exit(&session.session_id, None, Some("SIGSEGV"))
        .await
        .unwrap();

    let outcome = h
        .service
        .manual_override(failed.failure_id, ManualAction::Terminate)
        .await
        .unwrap();

    assert_eq!(outcome.strategy, RecoveryStrategy::ManualTerminate);
    assert!(outcome.success);
    assert_eq!(outcome.attempt, 0);
    assert_eq!(h.pipeline.failed.lock().unwrap()[0].0, h.workflow_id);
    assert!(h.service.get_active_failures(None).is_empty());
    assert!(h.service.detector().session(&session.session_id).is_none());

    // Manual attempts do not count towards escalation.
    let status = h.service.get_recovery_status(&session.session_id).await.unwrap();
    assert_eq!(status.automatic_attempts, 1);
    assert_eq!(status.history.len(), 2);
}

#[tokio::test]
async fn manual_reassign_spawns_another_agent_type() {
    let h = harness(FailureConfig::default()).await;
    let session = h.register("wf/qa").await;
    h.runtime.fail_restarts.store(1, Ordering::SeqCst);
    let failed = h
        .service
        .on_stall(&session.session_id, "idle")
        .await
        .unwrap();

    let outcome = h
        .service
        .manual_override(
            failed.failure_id,
            ManualAction::Reassign {
                agent_type: AgentType::Qa,
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.strategy, RecoveryStrategy::ManualReassign);
    assert!(outcome.success);
    let replacement = outcome.replacement.unwrap();
    assert_eq!(replacement.agent_type, AgentType::Qa);
    let current = h.service.detector().session(&session.session_id).unwrap();
    assert_eq!(current.agent_id, replacement.agent_id);
    assert_eq!(current.agent_type, AgentType::Qa);
}

#[tokio::test]
async fn override_of_unknown_failure_is_an_error() {
    let h = harness(FailureConfig::default()).await;
    let err = h
        .service
        .manual_override(Uuid::new_v4(), ManualAction::Terminate)
        .await
        .unwrap_err();
    assert!(matches!(err, RecoveryError::UnknownFailure(_)));
}

#[tokio::test]
async fn clean_exit_triggers_nothing() {
    let h = harness(FailureConfig::default()).await;
    let session = h.register("wf/planning").await;
    assert!(h
        .service
        .on_process_exit(&session.session_id, Some(0), None)
        .await
        .is_none());
    assert!(h.runtime.terminated.lock().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Queue-backed runtime
// ---------------------------------------------------------------------------

#[tokio::test]
async fn current_agent_waits_for_a_running_recovery() {
    let h = Arc::new(harness(FailureConfig::default()).await);
    let session = h.register("wf/implementation").await;
    let gate = Arc::new(Notify::new());
    *h.runtime.hold_restart.lock().unwrap() = Some(gate.clone());

    let stalled = {
        let h = h.clone();
        let id = session.session_id.clone();
        tokio::spawn(async move { h.service.on_stall(&id, "idle").await })
    };
    for _ in 0..100 {
        if !h.runtime.terminated.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(*h.runtime.terminated.lock().unwrap(), vec![session.agent_id]);

    let lookup = {
        let h = h.clone();
        let id = session.session_id.clone();
        tokio::spawn(async move { h.service.current_agent(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!lookup.is_finished(), "lookup must wait for the restart");

    gate.notify_one();
    let outcome = stalled.await.unwrap().expect("stall recovered");
    let current = lookup.await.unwrap().expect("session still registered");
    assert_eq!(Some(current.agent_id), outcome.replacement_agent());
    assert_ne!(current.agent_id, session.agent_id);
}

#[tokio::test]
async fn unregistering_a_session_drops_its_escalated_failures() {
    let cfg = FailureConfig {
        max_recovery_attempts: 0,
        ..FailureConfig::default()
    };
    let h = harness(cfg).await;
    let session = h.register("wf/qa").await;
    let outcome = h.service.on_stall(&session.session_id, "idle").await.unwrap();
    assert!(outcome.escalated());
    assert_eq!(h.service.get_active_failures(None).len(), 1);

    h.service.unregister_session(&session.session_id).await;
    assert!(h.service.get_active_failures(None).is_empty());
    assert!(h.service.current_agent(&session.session_id).await.is_none());
}

#[tokio::test]
async fn queue_runtime_restarts_and_carries_context() {
    let dir = tempfile::tempdir().unwrap();
    let context = Arc::new(ContextStore::new(
        Arc::new(MemoryCache::new(16)),
        Arc::new(SqliteRecentStore::open_in_memory().await.unwrap()),
        Arc::new(FsArchive::new(dir.path())),
        &ContextConfig::default(),
    ));
    let agents = AgentService::new(Arc::new(InMemoryAgentRepository::new()));
    let queue = Arc::new(JobQueue::new(QueueSettings {
        max_attempts: 2,
        backoff_base: Duration::from_millis(5),
        backoff_max: Duration::from_millis(10),
    }));
    let processor = Arc::new(JobProcessor::new(
        queue.store(),
        agents.clone(),
        RunnerRegistry::new(),
        context.clone(),
        Arc::new(NoopHooks),
        EventBus::new(),
    ));
    let shutdown = ShutdownSignal::new();
    let pool = WorkerPool::new(queue.clone(), processor, 2, shutdown.clone()).start();

    let old = agents
        .create("acme", AgentType::Dev, None, json!({}))
        .await
        .unwrap();
    agents.spawn(old.id, "acme").await.unwrap();
    context
        .save_context(old.id, "acme", &json!({"story": "S-1", "notes": ["tried a"]}))
        .await
        .unwrap();

    let runtime = QueueSessionRuntime::new(queue.clone(), context.clone());
    let session = SessionInfo {
        session_id: "wf/implementation".into(),
        agent_id: old.id,
        agent_type: AgentType::Dev,
        tenant_id: "acme".into(),
        workflow_id: None,
        task_id: None,
        phase: Some(WorkflowPhase::Implementation),
    };
    let mut cp = Checkpoint::new(&session);
    cp.revision = Some("abc123".into());

    runtime.terminate(&session).await.unwrap();
    let replacement = runtime
        .restart(&session, AgentType::Dev, Some(&cp))
        .await
        .unwrap();
    assert!(runtime.refresh_context(&session, &replacement).await.unwrap());

    assert_eq!(
        agents.get(old.id, "acme").await.unwrap().status,
        AgentStatus::Terminated
    );
    let new_agent = agents.get(replacement.agent_id, "acme").await.unwrap();
    assert_eq!(new_agent.status, AgentStatus::Running);
    assert_eq!(new_agent.config["resume"]["revision"], "abc123");
    assert_eq!(new_agent.config["replaces"], json!(old.id));
    assert_eq!(
        new_agent.context,
        Some(json!({"story": "S-1", "notes": ["tried a"]}))
    );

    shutdown.trigger();
    pool.await.unwrap();
}
