use std::fmt;

use chrono::{DateTime, Utc};
use fm_core::types::{AgentType, WorkflowPhase};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    SpawnAgent,
    ExecuteTask,
    RecoverContext,
    TerminateAgent,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::SpawnAgent => "spawn_agent",
            JobType::ExecuteTask => "execute_task",
            JobType::RecoverContext => "recover_context",
            JobType::TerminateAgent => "terminate_agent",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Links a job to the workflow phase that submitted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineLink {
    pub workflow_id: Uuid,
    pub phase: WorkflowPhase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub agent_id: Uuid,
    pub agent_type: AgentType,
    pub tenant_id: String,
    /// Job-type specific data. For `ExecuteTask` this is an
    /// [`AgentTask`](fm_agents::AgentTask); for `SpawnAgent` the agent config.
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub pipeline: Option<PipelineLink>,
}

/// What a caller submits to [`JobQueue::add_job`](crate::JobQueue::add_job).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_type: JobType,
    pub payload: JobPayload,
    /// Overrides the queue-wide attempt budget.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl JobSpec {
    pub fn new(job_type: JobType, payload: JobPayload) -> Self {
        Self {
            job_type,
            payload,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub payload: JobPayload,
    pub status: JobStatus,
    /// Mirror of the queue runtime's attempt count.
    pub attempts: u32,
    pub max_attempts: u32,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub(crate) fn from_spec(spec: JobSpec, default_max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type: spec.job_type,
            payload: spec.payload,
            status: JobStatus::Queued,
            attempts: 0,
            max_attempts: spec.max_attempts.unwrap_or(default_max_attempts).max(1),
            error: None,
            result: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub retrying: usize,
}
