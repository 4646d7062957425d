use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{AgentType, FailureType, WorkflowPhase};

/// A lifecycle event published on the [`EventBus`](crate::event_bus::EventBus).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn now(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum EventKind {
    #[serde(rename = "workflow.started")]
    WorkflowStarted {
        workflow_id: Uuid,
        task_id: Uuid,
        tenant_id: String,
        kind: String,
    },
    #[serde(rename = "phase.started")]
    PhaseStarted {
        workflow_id: Uuid,
        phase: WorkflowPhase,
        attempt: u32,
    },
    #[serde(rename = "agent.spawned")]
    AgentSpawned {
        workflow_id: Uuid,
        phase: WorkflowPhase,
        agent_id: Uuid,
        agent_type: AgentType,
    },
    #[serde(rename = "agent.completed")]
    AgentCompleted {
        workflow_id: Uuid,
        phase: WorkflowPhase,
        agent_id: Uuid,
    },
    #[serde(rename = "phase.failed")]
    PhaseFailed {
        workflow_id: Uuid,
        phase: WorkflowPhase,
        error: String,
    },
    #[serde(rename = "approval.gate_reached")]
    ApprovalGateReached {
        workflow_id: Uuid,
        phase: WorkflowPhase,
    },
    #[serde(rename = "workflow.paused")]
    WorkflowPaused { workflow_id: Uuid, reason: String },
    #[serde(rename = "workflow.resumed")]
    WorkflowResumed { workflow_id: Uuid },
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted { workflow_id: Uuid },
    #[serde(rename = "workflow.failed")]
    WorkflowFailed { workflow_id: Uuid, error: String },
    #[serde(rename = "job.completed")]
    JobCompleted {
        job_id: Uuid,
        job_type: String,
        attempts: u32,
    },
    #[serde(rename = "job.failed")]
    JobFailed {
        job_id: Uuid,
        job_type: String,
        attempts: u32,
        error: String,
        exhausted: bool,
    },
    #[serde(rename = "failure.detected")]
    FailureDetected {
        failure_id: Uuid,
        failure_type: FailureType,
        session_id: String,
        agent_id: Uuid,
    },
    #[serde(rename = "recovery.attempted")]
    RecoveryAttempted {
        failure_id: Uuid,
        session_id: String,
        strategy: String,
        success: bool,
    },
    #[serde(rename = "recovery.escalated")]
    RecoveryEscalated {
        failure_id: Uuid,
        session_id: String,
        workflow_id: Option<Uuid>,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::WorkflowStarted { .. } => "workflow.started",
            EventKind::PhaseStarted { .. } => "phase.started",
            EventKind::AgentSpawned { .. } => "agent.spawned",
            EventKind::AgentCompleted { .. } => "agent.completed",
            EventKind::PhaseFailed { .. } => "phase.failed",
            EventKind::ApprovalGateReached { .. } => "approval.gate_reached",
            EventKind::WorkflowPaused { .. } => "workflow.paused",
            EventKind::WorkflowResumed { .. } => "workflow.resumed",
            EventKind::WorkflowCompleted { .. } => "workflow.completed",
            EventKind::WorkflowFailed { .. } => "workflow.failed",
            EventKind::JobCompleted { .. } => "job.completed",
            EventKind::JobFailed { .. } => "job.failed",
            EventKind::FailureDetected { .. } => "failure.detected",
            EventKind::RecoveryAttempted { .. } => "recovery.attempted",
            EventKind::RecoveryEscalated { .. } => "recovery.escalated",
        }
    }

    /// The workflow this event belongs to, if any.
    pub fn workflow_id(&self) -> Option<Uuid> {
        match self {
            EventKind::WorkflowStarted { workflow_id, .. }
            | EventKind::PhaseStarted { workflow_id, .. }
            | EventKind::AgentSpawned { workflow_id, .. }
            | EventKind::AgentCompleted { workflow_id, .. }
            | EventKind::PhaseFailed { workflow_id, .. }
            | EventKind::ApprovalGateReached { workflow_id, .. }
            | EventKind::WorkflowPaused { workflow_id, .. }
            | EventKind::WorkflowResumed { workflow_id }
            | EventKind::WorkflowCompleted { workflow_id }
            | EventKind::WorkflowFailed { workflow_id, .. } => Some(*workflow_id),
            EventKind::RecoveryEscalated { workflow_id, .. } => *workflow_id,
            _ => None,
        }
    }
}
