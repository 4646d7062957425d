use std::sync::Arc;

use async_trait::async_trait;
use fm_context::ContextStore;
use fm_core::types::AgentType;
use fm_queue::{JobPayload, JobQueue, JobSpec, JobStatus, JobType};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RecoveryError, Result};
use crate::model::{Checkpoint, SessionInfo};

// ---------------------------------------------------------------------------
// SessionRuntime
// ---------------------------------------------------------------------------

/// Actions the recovery coordinator can take on a live session.
#[async_trait]
pub trait SessionRuntime: Send + Sync {
    /// Stop the session's current agent.
    async fn terminate(&self, session: &SessionInfo) -> Result<()>;

    /// Start a replacement agent of `agent_type`, resuming from `checkpoint`
    /// when given. Returns the session as served by the new agent.
    async fn restart(
        &self,
        session: &SessionInfo,
        agent_type: AgentType,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<SessionInfo>;

    /// Carry the failed agent's latest context over to its replacement.
    /// Returns `false` when no context was found.
    async fn refresh_context(&self, from: &SessionInfo, to: &SessionInfo) -> Result<bool>;
}

/// Drives sessions through the job queue, so recovery work gets the same
/// retry policy as everything else.
pub struct QueueSessionRuntime {
    queue: Arc<JobQueue>,
    context: Arc<ContextStore>,
}

impl QueueSessionRuntime {
    pub fn new(queue: Arc<JobQueue>, context: Arc<ContextStore>) -> Self {
        Self { queue, context }
    }

    async fn run(&self, job_type: JobType, payload: JobPayload) -> Result<serde_json::Value> {
        let id = self.queue.add_job(JobSpec::new(job_type, payload));
        let job = self.queue.wait_for_terminal(id).await?;
        match job.status {
            JobStatus::Completed => Ok(job.result.unwrap_or_default()),
            _ => Err(RecoveryError::Runtime(format!(
                "{job_type} job {id} failed: {}",
                job.error.unwrap_or_else(|| "unknown error".into())
            ))),
        }
    }
}

fn payload(session: &SessionInfo, data: serde_json::Value) -> JobPayload {
    JobPayload {
        agent_id: session.agent_id,
        agent_type: session.agent_type,
        tenant_id: session.tenant_id.clone(),
        data,
        // Recovery jobs stay out of the pipeline callbacks; the orchestrator
        // learns about the replacement from the recovery outcome.
        pipeline: None,
    }
}

#[async_trait]
impl SessionRuntime for QueueSessionRuntime {
    async fn terminate(&self, session: &SessionInfo) -> Result<()> {
        let result = self
            .run(JobType::TerminateAgent, payload(session, serde_json::Value::Null))
            .await?;
        debug!(session_id = %session.session_id, agent_id = %session.agent_id, %result, "session agent terminated");
        Ok(())
    }

    async fn restart(
        &self,
        session: &SessionInfo,
        agent_type: AgentType,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<SessionInfo> {
        let replacement = SessionInfo {
            agent_id: Uuid::new_v4(),
            agent_type,
            ..session.clone()
        };
        let config = json!({
            "replaces": session.agent_id,
            "resume": checkpoint.map(|cp| json!({
                "checkpoint_id": cp.id,
                "revision": cp.revision,
                "branch": cp.branch,
                "files": cp.files,
            })),
        });
        self.run(JobType::SpawnAgent, payload(&replacement, config))
            .await?;
        info!(
            session_id = %session.session_id,
            old_agent = %session.agent_id,
            new_agent = %replacement.agent_id,
            %agent_type,
            "replacement agent spawned"
        );
        Ok(replacement)
    }

    async fn refresh_context(&self, from: &SessionInfo, to: &SessionInfo) -> Result<bool> {
        let recovered = self
            .context
            .recover_context(from.agent_id, &from.tenant_id)
            .await
            .map_err(|e| RecoveryError::Runtime(e.to_string()))?;
        let Some(found) = recovered else {
            warn!(session_id = %from.session_id, agent_id = %from.agent_id, "no context to refresh from");
            return Ok(false);
        };
        self.context
            .save_context(to.agent_id, &to.tenant_id, &found.context)
            .await
            .map_err(|e| RecoveryError::Runtime(e.to_string()))?;
        // Attach the copied context to the replacement agent.
        let result = self
            .run(JobType::RecoverContext, payload(to, serde_json::Value::Null))
            .await?;
        Ok(result["recovered"].as_bool().unwrap_or(false))
    }
}

// ---------------------------------------------------------------------------
// PipelineControl
// ---------------------------------------------------------------------------

/// The orchestrator's pause/fail interface, as seen from recovery.
#[async_trait]
pub trait PipelineControl: Send + Sync {
    async fn pause(&self, workflow_id: Uuid, reason: &str) -> Result<()>;
    async fn fail(&self, workflow_id: Uuid, reason: &str) -> Result<()>;
}

pub struct NoopPipelineControl;

#[async_trait]
impl PipelineControl for NoopPipelineControl {
    async fn pause(&self, _: Uuid, _: &str) -> Result<()> {
        Ok(())
    }

    async fn fail(&self, _: Uuid, _: &str) -> Result<()> {
        Ok(())
    }
}
