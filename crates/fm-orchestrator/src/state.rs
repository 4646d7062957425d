use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fm_core::types::{AgentType, WorkflowPhase};
use fm_queue::JobStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::task::{Autonomy, DeliveryTask, TaskKind};

/// One agent spawned for a phase. Never removed, so retries stay auditable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub phase: WorkflowPhase,
    pub agent_id: Uuid,
    pub agent_type: AgentType,
    pub spawned_at: DateTime<Utc>,
    /// Set when the agent was spawned by recovery to replace a failed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces: Option<Uuid>,
}

/// Terminal job state reported back through the pipeline hooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub job_type: String,
    pub phase: WorkflowPhase,
    pub status: JobStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: Uuid,
    pub task_id: Uuid,
    pub tenant_id: String,
    pub kind: TaskKind,
    pub title: String,
    pub phase: WorkflowPhase,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Current agent per phase.
    pub agents: BTreeMap<WorkflowPhase, Uuid>,
    pub agent_history: Vec<AgentRecord>,
    /// Last result per phase, plus `rollback` when a deployment was undone.
    pub phase_results: BTreeMap<String, serde_json::Value>,
    pub jobs: Vec<JobRecord>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub autonomy: Autonomy,
    /// Why the workflow is paused, while it is.
    pub paused: Option<String>,
    pub error: Option<String>,
}

impl WorkflowState {
    pub fn new(task: &DeliveryTask, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id: task.id,
            tenant_id: task.tenant_id.clone(),
            kind: task.kind,
            title: task.title.clone(),
            phase: WorkflowPhase::Planning,
            started_at: now,
            updated_at: now,
            completed_at: None,
            agents: BTreeMap::new(),
            agent_history: Vec::new(),
            phase_results: BTreeMap::new(),
            jobs: Vec::new(),
            retry_count: 0,
            max_retries,
            autonomy: task.autonomy.clone(),
            paused: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Move to `next`. Staying in the current phase is a no-op; anything the
    /// phase table forbids is rejected without touching the state.
    pub fn advance(&mut self, next: WorkflowPhase) -> Result<()> {
        if next == self.phase {
            return Ok(());
        }
        if !self.phase.can_advance_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        let now = Utc::now();
        self.phase = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
            self.paused = None;
        }
        Ok(())
    }

    /// Mark the workflow failed. Returns `false` if it had already finished.
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.error = Some(error.into());
        // Every non-terminal phase may move to Failed.
        self.advance(WorkflowPhase::Failed).is_ok()
    }

    pub fn record_agent(
        &mut self,
        phase: WorkflowPhase,
        agent_id: Uuid,
        agent_type: AgentType,
        replaces: Option<Uuid>,
    ) {
        let now = Utc::now();
        self.agents.insert(phase, agent_id);
        self.agent_history.push(AgentRecord {
            phase,
            agent_id,
            agent_type,
            spawned_at: now,
            replaces,
        });
        self.updated_at = now;
    }

    pub fn set_result(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.phase_results.insert(key.into(), value);
        self.updated_at = Utc::now();
    }

    pub fn agents_of(&self, agent_type: AgentType) -> usize {
        self.agent_history
            .iter()
            .filter(|r| r.agent_type == agent_type)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> WorkflowState {
        WorkflowState::new(&DeliveryTask::new("acme", TaskKind::ImplementFeature), 3)
    }

    #[test]
    fn completed_at_tracks_terminal_phase() {
        let mut s = state();
        s.advance(WorkflowPhase::Implementation).unwrap();
        s.advance(WorkflowPhase::Qa).unwrap();
        assert!(s.completed_at.is_none());
        s.advance(WorkflowPhase::Completed).unwrap();
        assert!(s.completed_at.is_some());
        assert!(!s.fail("late"));
        assert!(s.error.is_none());
    }

    #[test]
    fn illegal_transition_leaves_state_untouched() {
        let mut s = state();
        s.advance(WorkflowPhase::Deployment).unwrap();
        let before = s.clone();
        let err = s.advance(WorkflowPhase::Qa).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
        assert_eq!(s, before);
    }

    #[test]
    fn agent_history_is_append_only() {
        let mut s = state();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        s.record_agent(WorkflowPhase::Implementation, first, AgentType::Dev, None);
        s.record_agent(WorkflowPhase::Implementation, second, AgentType::Dev, Some(first));
        assert_eq!(s.agents[&WorkflowPhase::Implementation], second);
        assert_eq!(s.agents_of(AgentType::Dev), 2);
        assert_eq!(s.agent_history[1].replaces, Some(first));
    }
}
