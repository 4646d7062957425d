use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::agent::{Agent, AgentStatus};
use crate::error::{AgentError, Result};

/// Storage for agents keyed by (agent id, tenant id).
///
/// Implementations must reject an update whose status change is not allowed
/// by [`AgentStatus::can_transition_to`], leaving the stored record untouched.
#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn create(&self, agent: Agent) -> Result<Agent>;
    async fn get(&self, agent_id: Uuid, tenant_id: &str) -> Result<Option<Agent>>;
    async fn list(&self, tenant_id: &str, status: Option<AgentStatus>) -> Result<Vec<Agent>>;
    async fn update(&self, agent: Agent) -> Result<Agent>;
}

#[derive(Default)]
pub struct InMemoryAgentRepository {
    agents: DashMap<(Uuid, String), Agent>,
}

impl InMemoryAgentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentRepository for InMemoryAgentRepository {
    async fn create(&self, agent: Agent) -> Result<Agent> {
        let key = (agent.id, agent.tenant_id.clone());
        match self.agents.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(AgentError::AlreadyExists(agent.id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(agent.clone());
                Ok(agent)
            }
        }
    }

    async fn get(&self, agent_id: Uuid, tenant_id: &str) -> Result<Option<Agent>> {
        Ok(self
            .agents
            .get(&(agent_id, tenant_id.to_string()))
            .map(|a| a.clone()))
    }

    async fn list(&self, tenant_id: &str, status: Option<AgentStatus>) -> Result<Vec<Agent>> {
        let mut agents: Vec<Agent> = self
            .agents
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .filter(|e| status.map_or(true, |s| e.status == s))
            .map(|e| e.value().clone())
            .collect();
        agents.sort_by_key(|a| a.created_at);
        Ok(agents)
    }

    async fn update(&self, agent: Agent) -> Result<Agent> {
        let key = (agent.id, agent.tenant_id.clone());
        let mut stored = self.agents.get_mut(&key).ok_or_else(|| AgentError::NotFound {
            agent_id: agent.id,
            tenant_id: agent.tenant_id.clone(),
        })?;
        if stored.status != agent.status && !stored.status.can_transition_to(agent.status) {
            return Err(AgentError::InvalidTransition {
                from: stored.status,
                to: agent.status,
            });
        }
        *stored = agent.clone();
        Ok(agent)
    }
}
