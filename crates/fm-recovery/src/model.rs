use std::fmt;

use chrono::{DateTime, Utc};
use fm_core::types::{AgentType, FailureType, WorkflowPhase};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a monitored agent run.
///
/// A session outlives the agents that serve it: a restart replaces
/// `agent_id` but keeps `session_id`, so repeated failures escalate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub agent_id: Uuid,
    pub agent_type: AgentType,
    pub tenant_id: String,
    pub workflow_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub phase: Option<WorkflowPhase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentFailure {
    pub id: Uuid,
    pub failure_type: FailureType,
    pub session_id: String,
    pub agent_id: Uuid,
    pub task_id: Option<Uuid>,
    pub workflow_id: Option<Uuid>,
    pub tenant_id: String,
    pub details: String,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
}

impl AgentFailure {
    pub fn new(failure_type: FailureType, session: &SessionInfo, details: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            failure_type,
            session_id: session.session_id.clone(),
            agent_id: session.agent_id,
            task_id: session.task_id,
            workflow_id: session.workflow_id,
            tenant_id: session.tenant_id.clone(),
            details: details.into(),
            detected_at: Utc::now(),
            resolved: false,
        }
    }
}

/// A lightweight recovery point recorded during an agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub session_id: String,
    pub agent_id: Uuid,
    pub tenant_id: String,
    /// Source revision (commit sha) to resume from.
    pub revision: Option<String>,
    pub branch: Option<String>,
    pub files: Vec<String>,
    pub tests_passing: Option<bool>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(session: &SessionInfo) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session.session_id.clone(),
            agent_id: session.agent_id,
            tenant_id: session.tenant_id.clone(),
            revision: None,
            branch: None,
            files: Vec::new(),
            tests_passing: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    RetryFromCheckpoint,
    ContextRefreshRetry,
    Escalation,
    ManualTerminate,
    ManualReassign,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStrategy::RetryFromCheckpoint => "retry_from_checkpoint",
            RecoveryStrategy::ContextRefreshRetry => "context_refresh_retry",
            RecoveryStrategy::Escalation => "escalation",
            RecoveryStrategy::ManualTerminate => "manual_terminate",
            RecoveryStrategy::ManualReassign => "manual_reassign",
        }
    }

    /// Automatic strategies count towards the escalation budget.
    pub fn is_automatic(&self) -> bool {
        matches!(
            self,
            RecoveryStrategy::RetryFromCheckpoint | RecoveryStrategy::ContextRefreshRetry
        )
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecoveryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retry_from_checkpoint" => Ok(RecoveryStrategy::RetryFromCheckpoint),
            "context_refresh_retry" => Ok(RecoveryStrategy::ContextRefreshRetry),
            "escalation" => Ok(RecoveryStrategy::Escalation),
            "manual_terminate" => Ok(RecoveryStrategy::ManualTerminate),
            "manual_reassign" => Ok(RecoveryStrategy::ManualReassign),
            other => Err(format!("unknown recovery strategy: {other}")),
        }
    }
}

/// One row of the append-only recovery history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub id: Uuid,
    pub failure_id: Uuid,
    pub session_id: String,
    pub agent_id: Uuid,
    pub failure_type: FailureType,
    pub strategy: RecoveryStrategy,
    pub success: bool,
    pub checkpoint_id: Option<Uuid>,
    pub message: String,
    pub attempted_at: DateTime<Utc>,
}

/// Human-forced remediation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ManualAction {
    /// Stop the session and fail the owning pipeline.
    Terminate,
    /// Replace the agent with one of another type, resuming from the latest
    /// checkpoint.
    Reassign { agent_type: AgentType },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub failure_id: Uuid,
    pub session_id: String,
    pub strategy: RecoveryStrategy,
    pub success: bool,
    /// 1-based automatic attempt number; 0 for manual overrides.
    pub attempt: u32,
    /// The session as served by the replacement agent, when one was spawned.
    pub replacement: Option<SessionInfo>,
    pub message: String,
}

impl RecoveryOutcome {
    pub fn escalated(&self) -> bool {
        self.strategy == RecoveryStrategy::Escalation
    }

    pub fn replacement_agent(&self) -> Option<Uuid> {
        self.replacement.as_ref().map(|s| s.agent_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStatus {
    pub session_id: String,
    pub automatic_attempts: usize,
    pub last_strategy: Option<RecoveryStrategy>,
    pub escalated: bool,
    pub open_failures: Vec<AgentFailure>,
    pub history: Vec<RecoveryAttempt>,
}
