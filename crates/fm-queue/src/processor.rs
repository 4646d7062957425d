use std::sync::Arc;

use chrono::Utc;
use fm_agents::{Agent, AgentError, AgentService, AgentStatus, AgentTask, RunnerRegistry};
use fm_context::ContextStore;
use fm_core::event_bus::EventBus;
use fm_core::events::EventKind;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::error::{JobError, Result};
use crate::hooks::PipelineHooks;
use crate::job::{Job, JobPayload, JobStatus, JobType};
use crate::queue::Delivery;
use crate::store::JobStore;

/// Executes one delivery of a job against the agent layer.
pub struct JobProcessor {
    store: Arc<JobStore>,
    agents: AgentService,
    runners: RunnerRegistry,
    context: Arc<ContextStore>,
    hooks: Arc<dyn PipelineHooks>,
    bus: EventBus,
}

impl JobProcessor {
    pub fn new(
        store: Arc<JobStore>,
        agents: AgentService,
        runners: RunnerRegistry,
        context: Arc<ContextStore>,
        hooks: Arc<dyn PipelineHooks>,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            agents,
            runners,
            context,
            hooks,
            bus,
        }
    }

    /// Run one attempt. On error the job's attempt counter is synchronised to
    /// the delivery's attempt number and the original error is returned.
    pub async fn process(&self, delivery: Delivery) -> Result<serde_json::Value> {
        let job = self
            .store
            .update(delivery.job_id, |job| {
                job.status = JobStatus::Processing;
                job.attempts = delivery.attempt;
            })
            .ok_or(JobError::UnknownJob(delivery.job_id))?;
        debug!(job_id = %job.id, job_type = %job.job_type, attempt = delivery.attempt, "processing job");

        match self.dispatch(&job).await {
            Ok(result) => {
                let done = self.store.update(job.id, |job| {
                    job.status = JobStatus::Completed;
                    job.attempts = delivery.attempt;
                    job.result = Some(result.clone());
                    job.error = None;
                    job.finished_at = Some(Utc::now());
                });
                info!(job_id = %job.id, job_type = %job.job_type, attempts = delivery.attempt, "job completed");
                self.bus.emit(EventKind::JobCompleted {
                    job_id: job.id,
                    job_type: job.job_type.to_string(),
                    attempts: delivery.attempt,
                });
                if let (Some(link), Some(done)) = (job.payload.pipeline, done) {
                    if let Err(e) = self.hooks.phase_completed(&link, &done).await {
                        warn!(job_id = %job.id, error = %e, "phase completion callback failed");
                    }
                }
                Ok(result)
            }
            Err(e) => {
                self.store.update(job.id, |job| {
                    job.attempts = delivery.attempt;
                    job.error = Some(e.to_string());
                });
                warn!(job_id = %job.id, attempt = delivery.attempt, error = %e, "job attempt failed");
                Err(e)
            }
        }
    }

    /// Called by the pool after every failed attempt.
    pub async fn on_failed(&self, delivery: Delivery, error: &JobError) {
        let Some(job) = self.store.get(delivery.job_id) else {
            return;
        };
        let exhausted = delivery.attempt >= job.max_attempts;
        let updated = self.store.update(job.id, |job| {
            job.attempts = delivery.attempt;
            job.error = Some(error.to_string());
            if exhausted {
                job.status = JobStatus::Failed;
                job.finished_at = Some(Utc::now());
            } else {
                job.status = JobStatus::Retrying;
            }
        });

        self.bus.emit(EventKind::JobFailed {
            job_id: job.id,
            job_type: job.job_type.to_string(),
            attempts: delivery.attempt,
            error: error.to_string(),
            exhausted,
        });

        if !exhausted {
            return;
        }
        error!(job_id = %job.id, attempts = delivery.attempt, error = %error, "job failed permanently");
        if let (Some(link), Some(failed)) = (job.payload.pipeline, updated) {
            if let Err(e) = self
                .hooks
                .phase_failed(&link, &failed, &error.to_string())
                .await
            {
                warn!(job_id = %job.id, error = %e, "phase failure callback failed");
            }
        }
    }

    async fn dispatch(&self, job: &Job) -> Result<serde_json::Value> {
        let p = &job.payload;
        match job.job_type {
            JobType::SpawnAgent => self.spawn_agent(p).await,
            JobType::ExecuteTask => self.execute_task(p).await,
            JobType::RecoverContext => self.recover_context(p).await,
            JobType::TerminateAgent => self.terminate_agent(p).await,
        }
    }

    async fn spawn_agent(&self, p: &JobPayload) -> Result<serde_json::Value> {
        let agent = match self.agents.find(p.agent_id, &p.tenant_id).await? {
            Some(agent) => agent,
            None => {
                let mut agent = Agent::with_id(p.agent_id, p.tenant_id.clone(), p.agent_type)
                    .with_config(p.data.clone());
                agent.workflow_id = p.pipeline.map(|link| link.workflow_id);
                self.agents.register(agent).await?
            }
        };

        // A redelivered spawn resumes wherever the previous attempt stopped.
        let agent = match agent.status {
            AgentStatus::Created => self.agents.spawn(p.agent_id, &p.tenant_id).await?,
            AgentStatus::Initializing => {
                self.agents
                    .transition(p.agent_id, &p.tenant_id, AgentStatus::Running)
                    .await?
            }
            AgentStatus::Running => agent,
            other => {
                return Err(AgentError::InvalidTransition {
                    from: other,
                    to: AgentStatus::Running,
                }
                .into())
            }
        };
        Ok(json!({ "agent_id": agent.id, "status": agent.status }))
    }

    async fn execute_task(&self, p: &JobPayload) -> Result<serde_json::Value> {
        let task: AgentTask = serde_json::from_value(p.data.clone())
            .map_err(|e| JobError::InvalidPayload(format!("execute_task data: {e}")))?;
        let agent = self.agents.get(p.agent_id, &p.tenant_id).await?;
        let runner = self.runners.get(p.agent_type)?;

        self.agents.heartbeat(agent.id, &agent.tenant_id).await?;
        let result = runner.execute(&agent, &task).await?;
        if let Err(e) = self.agents.heartbeat(agent.id, &agent.tenant_id).await {
            warn!(agent_id = %agent.id, error = %e, "post-task heartbeat failed");
        }
        Ok(result)
    }

    async fn recover_context(&self, p: &JobPayload) -> Result<serde_json::Value> {
        match self.context.recover_context(p.agent_id, &p.tenant_id).await? {
            Some(found) => {
                if let Err(e) = self
                    .agents
                    .set_context(p.agent_id, &p.tenant_id, found.context.clone())
                    .await
                {
                    warn!(agent_id = %p.agent_id, error = %e, "could not attach recovered context to agent");
                }
                Ok(json!({
                    "recovered": true,
                    "tier": found.tier,
                    "version": found.version,
                }))
            }
            None => Ok(json!({
                "recovered": false,
                "reason": "no context found in any tier",
            })),
        }
    }

    async fn terminate_agent(&self, p: &JobPayload) -> Result<serde_json::Value> {
        match self.agents.terminate(p.agent_id, &p.tenant_id).await {
            Ok(agent) => Ok(json!({
                "terminated": agent.status == AgentStatus::Terminated,
                "status": agent.status,
            })),
            Err(AgentError::NotFound { .. }) => Ok(json!({
                "terminated": false,
                "reason": "agent not found",
            })),
            Err(e) => {
                warn!(agent_id = %p.agent_id, error = %e, "terminate failed");
                Ok(json!({ "terminated": false, "reason": e.to_string() }))
            }
        }
    }
}
