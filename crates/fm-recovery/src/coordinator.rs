use std::sync::Arc;

use chrono::Utc;
use fm_core::config::FailureConfig;
use fm_core::event_bus::EventBus;
use fm_core::events::EventKind;
use fm_core::types::FailureType;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::error::Result;
use crate::history::RecoveryHistoryStore;
use crate::model::{
    AgentFailure, Checkpoint, ManualAction, RecoveryAttempt, RecoveryOutcome, RecoveryStrategy,
    SessionInfo,
};
use crate::runtime::{PipelineControl, SessionRuntime};

/// Pick the strategy for the `attempt`-th automatic recovery (1-based) of a
/// session.
///
/// Attempts below `max_attempts` retry from the latest checkpoint; the last
/// one refreshes context instead, as does every loop failure. Anything past
/// `max_attempts` escalates.
pub fn select_strategy(failure_type: FailureType, attempt: u32, max_attempts: u32) -> RecoveryStrategy {
    if attempt > max_attempts {
        RecoveryStrategy::Escalation
    } else if failure_type == FailureType::Loop || attempt == max_attempts {
        RecoveryStrategy::ContextRefreshRetry
    } else {
        RecoveryStrategy::RetryFromCheckpoint
    }
}

struct Applied {
    success: bool,
    replacement: Option<SessionInfo>,
    checkpoint_id: Option<Uuid>,
    message: String,
}

impl Applied {
    fn failed(checkpoint_id: Option<Uuid>, message: String) -> Self {
        Self {
            success: false,
            replacement: None,
            checkpoint_id,
            message,
        }
    }
}

/// Chooses and carries out remediation for detected failures.
pub struct RecoveryCoordinator {
    checkpoints: CheckpointStore,
    history: RecoveryHistoryStore,
    runtime: Arc<dyn SessionRuntime>,
    pipeline: Arc<dyn PipelineControl>,
    bus: EventBus,
    max_attempts: u32,
}

impl RecoveryCoordinator {
    pub fn new(
        checkpoints: CheckpointStore,
        history: RecoveryHistoryStore,
        runtime: Arc<dyn SessionRuntime>,
        pipeline: Arc<dyn PipelineControl>,
        bus: EventBus,
        cfg: &FailureConfig,
    ) -> Self {
        Self {
            checkpoints,
            history,
            runtime,
            pipeline,
            bus,
            max_attempts: cfg.max_recovery_attempts,
        }
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn history(&self) -> &RecoveryHistoryStore {
        &self.history
    }

    /// Run the next automatic strategy for `failure`. The attempt is written
    /// to the history whatever its outcome.
    pub async fn recover(
        &self,
        failure: &AgentFailure,
        session: &SessionInfo,
    ) -> Result<RecoveryOutcome> {
        let prior = self.history.automatic_attempts(&session.session_id).await?;
        let attempt = u32::try_from(prior).unwrap_or(u32::MAX).saturating_add(1);
        let strategy = select_strategy(failure.failure_type, attempt, self.max_attempts);
        info!(
            failure_id = %failure.id,
            session_id = %session.session_id,
            failure_type = %failure.failure_type,
            attempt,
            %strategy,
            "recovery attempt starting"
        );

        let applied = match strategy {
            RecoveryStrategy::RetryFromCheckpoint => self.retry_from_checkpoint(session).await,
            RecoveryStrategy::ContextRefreshRetry => self.context_refresh_retry(session).await,
            _ => self.escalate(failure, session, attempt).await,
        };
        Ok(self.finish(failure, session, strategy, attempt, applied).await)
    }

    /// Human-forced remediation. Manual attempts are recorded but do not count
    /// towards escalation.
    pub async fn manual_override(
        &self,
        failure: &AgentFailure,
        session: &SessionInfo,
        action: ManualAction,
    ) -> Result<RecoveryOutcome> {
        let (strategy, applied) = match action {
            ManualAction::Terminate => {
                let applied = match self.runtime.terminate(session).await {
                    Ok(()) => Applied {
                        success: true,
                        replacement: None,
                        checkpoint_id: None,
                        message: "session terminated by operator".into(),
                    },
                    Err(e) => Applied::failed(None, format!("terminate failed: {e}")),
                };
                if let Some(workflow_id) = session.workflow_id {
                    if let Err(e) = self
                        .pipeline
                        .fail(workflow_id, "agent session terminated by operator")
                        .await
                    {
                        warn!(workflow_id = %workflow_id, error = %e, "could not fail pipeline");
                    }
                }
                (RecoveryStrategy::ManualTerminate, applied)
            }
            ManualAction::Reassign { agent_type } => {
                let checkpoint = self.latest_checkpoint(session).await;
                let applied = self
                    .replace(session, agent_type, checkpoint.as_ref())
                    .await
                    .map(|replacement| Applied {
                        success: true,
                        message: format!("reassigned to {agent_type} agent {}", replacement.agent_id),
                        replacement: Some(replacement),
                        checkpoint_id: checkpoint.as_ref().map(|cp| cp.id),
                    })
                    .unwrap_or_else(|e| {
                        Applied::failed(checkpoint.as_ref().map(|cp| cp.id), format!("reassign failed: {e}"))
                    });
                (RecoveryStrategy::ManualReassign, applied)
            }
        };
        Ok(self.finish(failure, session, strategy, 0, applied).await)
    }

    // -- Strategies ---------------------------------------------------------

    async fn retry_from_checkpoint(&self, session: &SessionInfo) -> Applied {
        let checkpoint = self.latest_checkpoint(session).await;
        let checkpoint_id = checkpoint.as_ref().map(|cp| cp.id);
        match self
            .replace(session, session.agent_type, checkpoint.as_ref())
            .await
        {
            Ok(replacement) => {
                let from = checkpoint
                    .as_ref()
                    .and_then(|cp| cp.revision.clone())
                    .unwrap_or_else(|| "scratch".into());
                Applied {
                    success: true,
                    message: format!("restarted as {} from {from}", replacement.agent_id),
                    replacement: Some(replacement),
                    checkpoint_id,
                }
            }
            Err(e) => Applied::failed(checkpoint_id, format!("retry from checkpoint failed: {e}")),
        }
    }

    async fn context_refresh_retry(&self, session: &SessionInfo) -> Applied {
        let checkpoint = self.latest_checkpoint(session).await;
        let checkpoint_id = checkpoint.as_ref().map(|cp| cp.id);
        let replacement = match self
            .replace(session, session.agent_type, checkpoint.as_ref())
            .await
        {
            Ok(replacement) => replacement,
            Err(e) => return Applied::failed(checkpoint_id, format!("context refresh failed: {e}")),
        };
        let message = match self.runtime.refresh_context(session, &replacement).await {
            Ok(true) => format!("restarted as {} with refreshed context", replacement.agent_id),
            Ok(false) => format!("restarted as {} with empty context", replacement.agent_id),
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "context refresh failed, continuing with fresh agent");
                format!("restarted as {} without context: {e}", replacement.agent_id)
            }
        };
        Applied {
            success: true,
            replacement: Some(replacement),
            checkpoint_id,
            message,
        }
    }

    async fn escalate(&self, failure: &AgentFailure, session: &SessionInfo, attempt: u32) -> Applied {
        let reason = format!(
            "{} failure on session {} persisted after {} recovery attempts",
            failure.failure_type,
            session.session_id,
            attempt.saturating_sub(1)
        );
        if let Some(workflow_id) = session.workflow_id {
            if let Err(e) = self.pipeline.pause(workflow_id, &reason).await {
                warn!(workflow_id = %workflow_id, error = %e, "could not pause pipeline");
            }
        }
        error!(failure_id = %failure.id, session_id = %session.session_id, "failure escalated to operator");
        self.bus.emit(EventKind::RecoveryEscalated {
            failure_id: failure.id,
            session_id: session.session_id.clone(),
            workflow_id: session.workflow_id,
        });
        Applied::failed(None, reason)
    }

    // -- Helpers ------------------------------------------------------------

    async fn latest_checkpoint(&self, session: &SessionInfo) -> Option<Checkpoint> {
        match self.checkpoints.latest(&session.session_id).await {
            Ok(cp) => cp,
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "checkpoint lookup failed");
                None
            }
        }
    }

    /// Terminate the current agent and start a replacement. A failed
    /// terminate is logged; the replacement still starts.
    async fn replace(
        &self,
        session: &SessionInfo,
        agent_type: fm_core::types::AgentType,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<SessionInfo> {
        if let Err(e) = self.runtime.terminate(session).await {
            warn!(session_id = %session.session_id, agent_id = %session.agent_id, error = %e, "terminate before restart failed");
        }
        self.runtime.restart(session, agent_type, checkpoint).await
    }

    async fn finish(
        &self,
        failure: &AgentFailure,
        session: &SessionInfo,
        strategy: RecoveryStrategy,
        attempt: u32,
        applied: Applied,
    ) -> RecoveryOutcome {
        let record = RecoveryAttempt {
            id: Uuid::new_v4(),
            failure_id: failure.id,
            session_id: session.session_id.clone(),
            agent_id: session.agent_id,
            failure_type: failure.failure_type,
            strategy,
            success: applied.success,
            checkpoint_id: applied.checkpoint_id,
            message: applied.message.clone(),
            attempted_at: Utc::now(),
        };
        if let Err(e) = self.history.append(&record).await {
            error!(failure_id = %failure.id, error = %e, "could not record recovery attempt");
        }
        self.bus.emit(EventKind::RecoveryAttempted {
            failure_id: failure.id,
            session_id: session.session_id.clone(),
            strategy: strategy.to_string(),
            success: applied.success,
        });
        info!(
            failure_id = %failure.id,
            session_id = %session.session_id,
            %strategy,
            success = applied.success,
            message = %applied.message,
            "recovery attempt finished"
        );
        RecoveryOutcome {
            failure_id: failure.id,
            session_id: session.session_id.clone(),
            strategy,
            success: applied.success,
            attempt,
            replacement: applied.replacement,
            message: applied.message,
        }
    }
}
