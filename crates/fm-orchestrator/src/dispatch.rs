use std::sync::Arc;

use fm_agents::AgentTask;
use fm_core::types::AgentType;
use fm_queue::{Job, JobPayload, JobQueue, JobSpec, JobStatus, JobType, PipelineLink};
use tracing::debug;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

/// Submits workflow work to the job queue and suspends until it finishes.
#[derive(Clone)]
pub struct QueueDispatch {
    queue: Arc<JobQueue>,
}

impl QueueDispatch {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Create and start a fresh agent for `link`'s phase.
    pub async fn spawn(
        &self,
        link: PipelineLink,
        agent_type: AgentType,
        tenant_id: &str,
        config: serde_json::Value,
    ) -> Result<Uuid> {
        let agent_id = Uuid::new_v4();
        self.submit(
            JobType::SpawnAgent,
            JobPayload {
                agent_id,
                agent_type,
                tenant_id: tenant_id.to_string(),
                data: config,
                pipeline: Some(link),
            },
        )
        .await?;
        Ok(agent_id)
    }

    pub async fn execute(
        &self,
        link: PipelineLink,
        agent_id: Uuid,
        agent_type: AgentType,
        tenant_id: &str,
        task: &AgentTask,
    ) -> Result<serde_json::Value> {
        let job = self
            .submit(
                JobType::ExecuteTask,
                JobPayload {
                    agent_id,
                    agent_type,
                    tenant_id: tenant_id.to_string(),
                    data: serde_json::to_value(task).map_err(|e| {
                        OrchestratorError::InvalidTask(format!("unserializable task: {e}"))
                    })?,
                    pipeline: Some(link),
                },
            )
            .await?;
        Ok(job.result.unwrap_or_default())
    }

    async fn submit(&self, job_type: JobType, payload: JobPayload) -> Result<Job> {
        let id = self.queue.add_job(JobSpec::new(job_type, payload));
        let job = self.queue.wait_for_terminal(id).await?;
        debug!(job_id = %id, %job_type, status = ?job.status, attempts = job.attempts, "pipeline job finished");
        match job.status {
            JobStatus::Completed => Ok(job),
            _ => Err(OrchestratorError::JobFailed {
                job_id: id,
                job_type: job_type.to_string(),
                error: job.error.unwrap_or_else(|| "unknown error".into()),
            }),
        }
    }
}
