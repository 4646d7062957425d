use std::fmt;

use chrono::{DateTime, Utc};
use fm_core::types::AgentType;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AgentError, Result};

// ---------------------------------------------------------------------------
// AgentStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Created,
    Initializing,
    Running,
    Paused,
    Completed,
    Failed,
    Terminated,
}

impl AgentStatus {
    /// Valid transitions:
    /// - Created      -> Initializing
    /// - Initializing -> Running | Failed | Terminated
    /// - Running      -> Paused | Completed | Failed | Terminated
    /// - Paused       -> Running | Terminated
    ///
    /// Completed, Failed and Terminated are absorbing.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, next),
            (Created, Initializing)
                | (Initializing, Running)
                | (Initializing, Failed)
                | (Initializing, Terminated)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Terminated)
                | (Paused, Running)
                | (Paused, Terminated)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Terminated
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentStatus::Created => "created",
            AgentStatus::Initializing => "initializing",
            AgentStatus::Running => "running",
            AgentStatus::Paused => "paused",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Terminated => "terminated",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: AgentStatus,
    pub to: AgentStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub tenant_id: String,
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub workflow_id: Option<Uuid>,
    /// Spawn-time configuration (e.g. QA feedback, resume revision).
    pub config: serde_json::Value,
    /// Latest working context.
    pub context: Option<serde_json::Value>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<StatusChange>,
}

impl Agent {
    pub fn new(tenant_id: impl Into<String>, agent_type: AgentType) -> Self {
        Self::with_id(Uuid::new_v4(), tenant_id, agent_type)
    }

    pub fn with_id(id: Uuid, tenant_id: impl Into<String>, agent_type: AgentType) -> Self {
        let now = Utc::now();
        Self {
            id,
            tenant_id: tenant_id.into(),
            agent_type,
            status: AgentStatus::Created,
            workflow_id: None,
            config: serde_json::Value::Null,
            context: None,
            last_heartbeat: None,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    pub fn with_workflow(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Move to `next`, rejecting disallowed transitions before any mutation.
    pub fn transition(&mut self, next: AgentStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(AgentError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        self.history.push(StatusChange {
            from: self.status,
            to: next,
            at: now,
        });
        tracing::debug!(agent_id = %self.id, from = %self.status, to = %next, "agent status transition");
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}
