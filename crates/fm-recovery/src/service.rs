use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{error, warn};
use uuid::Uuid;

use crate::coordinator::RecoveryCoordinator;
use crate::detector::FailureDetector;
use crate::error::{RecoveryError, Result};
use crate::model::{
    AgentFailure, Checkpoint, ManualAction, RecoveryOutcome, RecoveryStatus, RecoveryStrategy,
    SessionInfo,
};

/// The failure subsystem as the orchestrator sees it.
///
/// Each signal handler returns the outcome of the recovery it triggered, or
/// `None` when the signal did not amount to a failure (or recovery could not
/// run at all).
#[async_trait]
pub trait FailureRecovery: Send + Sync {
    async fn register_session(&self, session: SessionInfo);
    async fn unregister_session(&self, session_id: &str);
    async fn on_process_exit(
        &self,
        session_id: &str,
        exit_code: Option<i32>,
        signal: Option<&str>,
    ) -> Option<RecoveryOutcome>;
    async fn on_stall(&self, session_id: &str, reason: &str) -> Option<RecoveryOutcome>;
    async fn on_file_modified(&self, session_id: &str, path: &str) -> Option<RecoveryOutcome>;
    async fn on_test_run(&self, session_id: &str, passed: bool);
    async fn record_checkpoint(&self, checkpoint: Checkpoint);

    /// The session as currently served, once any recovery running on it has
    /// finished. The agent differs from the one registered when recovery
    /// replaced it.
    async fn current_agent(&self, session_id: &str) -> Option<SessionInfo>;
}

/// Detector plus coordinator.
///
/// Recoveries on one session never overlap: a failure is raised and
/// remediated under the session's lock, and [`current_agent`] waits on the
/// same lock.
///
/// [`current_agent`]: FailureRecovery::current_agent
pub struct RecoveryService {
    detector: Arc<FailureDetector>,
    coordinator: RecoveryCoordinator,
    session_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RecoveryService {
    pub fn new(detector: Arc<FailureDetector>, coordinator: RecoveryCoordinator) -> Self {
        Self {
            detector,
            coordinator,
            session_locks: DashMap::new(),
        }
    }

    pub fn detector(&self) -> &FailureDetector {
        &self.detector
    }

    pub fn get_active_failures(&self, session_id: Option<&str>) -> Vec<AgentFailure> {
        self.detector.get_active_failures(session_id)
    }

    pub async fn get_recovery_status(&self, session_id: &str) -> Result<RecoveryStatus> {
        let history = self.coordinator.history().for_session(session_id).await?;
        Ok(RecoveryStatus {
            session_id: session_id.to_string(),
            automatic_attempts: history.iter().filter(|a| a.strategy.is_automatic()).count(),
            last_strategy: history.last().map(|a| a.strategy),
            escalated: history
                .iter()
                .any(|a| a.strategy == RecoveryStrategy::Escalation),
            open_failures: self.detector.get_active_failures(Some(session_id)),
            history,
        })
    }

    /// Apply a human decision to an unresolved failure.
    pub async fn manual_override(
        &self,
        failure_id: Uuid,
        action: ManualAction,
    ) -> Result<RecoveryOutcome> {
        let failure = self
            .detector
            .get_failure(failure_id)
            .ok_or(RecoveryError::UnknownFailure(failure_id))?;
        let lock = self.lock_for(&failure.session_id);
        let outcome = {
            let _held = lock.lock().await;
            self.apply_override(&failure, action).await
        };
        self.release_lock(&failure.session_id, lock);
        outcome
    }

    async fn apply_override(
        &self,
        failure: &AgentFailure,
        action: ManualAction,
    ) -> Result<RecoveryOutcome> {
        let session = self
            .detector
            .session(&failure.session_id)
            .ok_or_else(|| RecoveryError::UnknownSession(failure.session_id.clone()))?;
        let outcome = self
            .coordinator
            .manual_override(failure, &session, action)
            .await?;
        self.apply(&outcome);
        if outcome.success && action == ManualAction::Terminate {
            self.detector.unregister_session(&session.session_id);
        }
        Ok(outcome)
    }

    /// Sweep for sessions past their maximum duration and recover each.
    pub async fn check_timeouts(&self) -> Vec<RecoveryOutcome> {
        let mut outcomes = Vec::new();
        for session_id in self.detector.session_ids() {
            let detector = &self.detector;
            let recovered = self
                .raise_and_recover(&session_id, || detector.check_timeout(&session_id))
                .await;
            outcomes.extend(recovered);
        }
        outcomes
    }

    fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.session_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_lock(&self, session_id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.session_locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Raise a failure and remediate it while holding the session's lock.
    async fn raise_and_recover(
        &self,
        session_id: &str,
        raise: impl FnOnce() -> Option<AgentFailure> + Send,
    ) -> Option<RecoveryOutcome> {
        let lock = self.lock_for(session_id);
        let outcome = {
            let _held = lock.lock().await;
            match raise() {
                Some(failure) => self.recover(failure).await,
                None => None,
            }
        };
        self.release_lock(session_id, lock);
        outcome
    }

    async fn recover(&self, failure: AgentFailure) -> Option<RecoveryOutcome> {
        let session = self.detector.session(&failure.session_id)?;
        match self.coordinator.recover(&failure, &session).await {
            Ok(outcome) => {
                self.apply(&outcome);
                Some(outcome)
            }
            Err(e) => {
                error!(failure_id = %failure.id, session_id = %failure.session_id, error = %e, "recovery could not run");
                None
            }
        }
    }

    fn apply(&self, outcome: &RecoveryOutcome) {
        if !outcome.success {
            return;
        }
        self.detector.resolve(outcome.failure_id);
        if let Some(replacement) = &outcome.replacement {
            self.detector
                .replace_agent(&outcome.session_id, replacement.clone());
        }
    }
}

#[async_trait]
impl FailureRecovery for RecoveryService {
    async fn register_session(&self, session: SessionInfo) {
        self.detector.register_session(session);
    }

    async fn unregister_session(&self, session_id: &str) {
        self.detector.unregister_session(session_id);
    }

    async fn on_process_exit(
        &self,
        session_id: &str,
        exit_code: Option<i32>,
        signal: Option<&str>,
    ) -> Option<RecoveryOutcome> {
        self.raise_and_recover(session_id, || {
            self.detector.on_process_exit(session_id, exit_code, signal)
        })
        .await
    }

    async fn on_stall(&self, session_id: &str, reason: &str) -> Option<RecoveryOutcome> {
        self.raise_and_recover(session_id, || self.detector.on_stall(session_id, reason))
            .await
    }

    async fn on_file_modified(&self, session_id: &str, path: &str) -> Option<RecoveryOutcome> {
        self.raise_and_recover(session_id, || {
            self.detector.on_file_modified(session_id, path)
        })
        .await
    }

    async fn on_test_run(&self, session_id: &str, passed: bool) {
        self.detector.on_test_run(session_id, passed);
    }

    async fn record_checkpoint(&self, checkpoint: Checkpoint) {
        if let Err(e) = self.coordinator.checkpoints().record(&checkpoint).await {
            warn!(session_id = %checkpoint.session_id, error = %e, "could not record checkpoint");
        }
    }

    async fn current_agent(&self, session_id: &str) -> Option<SessionInfo> {
        let running = self
            .session_locks
            .get(session_id)
            .map(|lock| Arc::clone(lock.value()));
        if let Some(lock) = running {
            drop(lock.lock().await);
            self.release_lock(session_id, lock);
        }
        self.detector.session(session_id)
    }
}

/// Used when no failure subsystem is wired: signals are ignored.
pub struct NoopFailureRecovery;

#[async_trait]
impl FailureRecovery for NoopFailureRecovery {
    async fn register_session(&self, _: SessionInfo) {}

    async fn unregister_session(&self, _: &str) {}

    async fn on_process_exit(&self, _: &str, _: Option<i32>, _: Option<&str>) -> Option<RecoveryOutcome> {
        None
    }

    async fn on_stall(&self, _: &str, _: &str) -> Option<RecoveryOutcome> {
        None
    }

    async fn on_file_modified(&self, _: &str, _: &str) -> Option<RecoveryOutcome> {
        None
    }

    async fn on_test_run(&self, _: &str, _: bool) {}

    async fn record_checkpoint(&self, _: Checkpoint) {}

    async fn current_agent(&self, _: &str) -> Option<SessionInfo> {
        None
    }
}
