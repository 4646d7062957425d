use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fm_core::types::AgentType;
use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::error::{AgentError, Result};

/// One unit of work handed to an agent implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    /// Action name, e.g. `implement-story` or `run-tests`.
    pub action: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

impl AgentTask {
    pub fn new(action: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            action: action.into(),
            input,
        }
    }
}

/// Execution capability for one agent type. Returns the task's JSON result;
/// any error is treated as a failed attempt by the job queue.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn execute(&self, agent: &Agent, task: &AgentTask) -> Result<serde_json::Value>;
}

#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: HashMap<AgentType, Arc<dyn AgentRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runner(mut self, agent_type: AgentType, runner: Arc<dyn AgentRunner>) -> Self {
        self.register(agent_type, runner);
        self
    }

    pub fn register(&mut self, agent_type: AgentType, runner: Arc<dyn AgentRunner>) {
        self.runners.insert(agent_type, runner);
    }

    pub fn get(&self, agent_type: AgentType) -> Result<Arc<dyn AgentRunner>> {
        self.runners
            .get(&agent_type)
            .cloned()
            .ok_or(AgentError::NoRunner(agent_type))
    }

    pub fn registered(&self) -> Vec<AgentType> {
        let mut types: Vec<AgentType> = self.runners.keys().copied().collect();
        types.sort();
        types
    }
}
