use std::collections::BTreeMap;

use fm_core::types::{AgentType, WorkflowPhase};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::state::{AgentRecord, WorkflowState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    ImplementFeature,
    FixBug,
    Deploy,
    FullLifecycle,
    Custom,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::ImplementFeature => "implement-feature",
            TaskKind::FixBug => "fix-bug",
            TaskKind::Deploy => "deploy",
            TaskKind::FullLifecycle => "full-lifecycle",
            TaskKind::Custom => "custom",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much a workflow may do without a human.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Autonomy {
    #[default]
    Full,
    /// Phases named here are approval gates. Reaching one is logged and
    /// published; the workflow does not block on it.
    SemiAutonomous {
        #[serde(default, alias = "approvalGates")]
        approval_gates: Vec<WorkflowPhase>,
    },
}

impl Autonomy {
    pub fn is_gate(&self, phase: WorkflowPhase) -> bool {
        match self {
            Autonomy::Full => false,
            Autonomy::SemiAutonomous { approval_gates } => approval_gates.contains(&phase),
        }
    }
}

/// One step of a `custom` workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomStep {
    pub phase: WorkflowPhase,
    #[serde(alias = "agentType")]
    pub agent_type: AgentType,
    pub action: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// A delivery task submitted to [`Orchestrator::execute_task`](crate::Orchestrator::execute_task).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryTask {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(alias = "tenantId")]
    pub tenant_id: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub title: String,
    /// Free-form input handed to every agent (story, bug report, target
    /// environment, ...).
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default, alias = "maxRetries")]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub autonomy: Autonomy,
    #[serde(default)]
    pub steps: Vec<CustomStep>,
}

impl DeliveryTask {
    pub fn new(tenant_id: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            kind,
            title: String::new(),
            input: serde_json::Value::Null,
            max_retries: None,
            autonomy: Autonomy::Full,
            steps: Vec::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_autonomy(mut self, autonomy: Autonomy) -> Self {
        self.autonomy = autonomy;
        self
    }

    pub fn with_step(mut self, step: CustomStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidTask("tenant_id must not be empty".into()));
        }
        match self.kind {
            TaskKind::Custom if self.steps.is_empty() => Err(OrchestratorError::InvalidTask(
                "custom workflows need at least one step".into(),
            )),
            TaskKind::Custom => {
                let mut phase = WorkflowPhase::Planning;
                for step in &self.steps {
                    if step.phase.is_terminal() {
                        return Err(OrchestratorError::InvalidTask(format!(
                            "step {:?} targets terminal phase {}",
                            step.action, step.phase
                        )));
                    }
                    if step.phase != phase && !phase.can_advance_to(step.phase) {
                        return Err(OrchestratorError::InvalidTask(format!(
                            "step {:?} cannot move from {} to {}",
                            step.action, phase, step.phase
                        )));
                    }
                    phase = step.phase;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Completed,
    Failed,
}

/// Terminal result of [`Orchestrator::execute_task`](crate::Orchestrator::execute_task).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub status: WorkflowStatus,
    pub error: Option<String>,
    pub phase_results: BTreeMap<String, serde_json::Value>,
    pub agents: Vec<AgentRecord>,
    pub workflow: WorkflowState,
}

impl From<WorkflowState> for WorkflowOutcome {
    fn from(state: WorkflowState) -> Self {
        let status = if state.phase == WorkflowPhase::Completed {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Failed
        };
        Self {
            status,
            error: state.error.clone(),
            phase_results: state.phase_results.clone(),
            agents: state.agent_history.clone(),
            workflow: state,
        }
    }
}

/// Result of [`Orchestrator::cancel_workflow`](crate::Orchestrator::cancel_workflow).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub terminated_agents: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
