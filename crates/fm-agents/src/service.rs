use std::sync::Arc;

use chrono::Utc;
use fm_core::types::AgentType;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentStatus};
use crate::error::{AgentError, Result};
use crate::repository::AgentRepository;

/// Lifecycle operations over an [`AgentRepository`].
#[derive(Clone)]
pub struct AgentService {
    repo: Arc<dyn AgentRepository>,
}

impl AgentService {
    pub fn new(repo: Arc<dyn AgentRepository>) -> Self {
        Self { repo }
    }

    pub async fn create(
        &self,
        tenant_id: &str,
        agent_type: AgentType,
        workflow_id: Option<Uuid>,
        config: serde_json::Value,
    ) -> Result<Agent> {
        let mut agent = Agent::new(tenant_id, agent_type).with_config(config);
        agent.workflow_id = workflow_id;
        self.register(agent).await
    }

    /// Store a fully-built agent record (its id chosen by the caller).
    pub async fn register(&self, agent: Agent) -> Result<Agent> {
        let agent = self.repo.create(agent).await?;
        info!(agent_id = %agent.id, agent_type = %agent.agent_type, tenant = %agent.tenant_id, "agent created");
        Ok(agent)
    }

    pub async fn get(&self, agent_id: Uuid, tenant_id: &str) -> Result<Agent> {
        self.repo
            .get(agent_id, tenant_id)
            .await?
            .ok_or_else(|| AgentError::NotFound {
                agent_id,
                tenant_id: tenant_id.to_string(),
            })
    }

    pub async fn find(&self, agent_id: Uuid, tenant_id: &str) -> Result<Option<Agent>> {
        self.repo.get(agent_id, tenant_id).await
    }

    pub async fn list(&self, tenant_id: &str, status: Option<AgentStatus>) -> Result<Vec<Agent>> {
        self.repo.list(tenant_id, status).await
    }

    pub async fn transition(
        &self,
        agent_id: Uuid,
        tenant_id: &str,
        next: AgentStatus,
    ) -> Result<Agent> {
        let mut agent = self.get(agent_id, tenant_id).await?;
        agent.transition(next)?;
        self.repo.update(agent).await
    }

    /// Created -> Initializing -> Running.
    pub async fn spawn(&self, agent_id: Uuid, tenant_id: &str) -> Result<Agent> {
        self.transition(agent_id, tenant_id, AgentStatus::Initializing)
            .await?;
        let agent = self
            .transition(agent_id, tenant_id, AgentStatus::Running)
            .await?;
        info!(agent_id = %agent_id, agent_type = %agent.agent_type, "agent running");
        Ok(agent)
    }

    /// Move to Terminated when the table allows it. Agents already in a
    /// terminal state are returned unchanged.
    pub async fn terminate(&self, agent_id: Uuid, tenant_id: &str) -> Result<Agent> {
        let agent = self.get(agent_id, tenant_id).await?;
        if agent.status.is_terminal() {
            return Ok(agent);
        }
        if agent.status == AgentStatus::Created {
            // Created cannot jump straight to Terminated.
            self.transition(agent_id, tenant_id, AgentStatus::Initializing)
                .await?;
        }
        let agent = self
            .transition(agent_id, tenant_id, AgentStatus::Terminated)
            .await?;
        info!(agent_id = %agent_id, "agent terminated");
        Ok(agent)
    }

    pub async fn complete(&self, agent_id: Uuid, tenant_id: &str) -> Result<Agent> {
        self.transition(agent_id, tenant_id, AgentStatus::Completed)
            .await
    }

    pub async fn fail(&self, agent_id: Uuid, tenant_id: &str) -> Result<Agent> {
        let agent = self
            .transition(agent_id, tenant_id, AgentStatus::Failed)
            .await?;
        warn!(agent_id = %agent_id, "agent failed");
        Ok(agent)
    }

    pub async fn heartbeat(&self, agent_id: Uuid, tenant_id: &str) -> Result<()> {
        let mut agent = self.get(agent_id, tenant_id).await?;
        let now = Utc::now();
        agent.last_heartbeat = Some(now);
        agent.updated_at = now;
        self.repo.update(agent).await?;
        Ok(())
    }

    pub async fn set_context(
        &self,
        agent_id: Uuid,
        tenant_id: &str,
        context: serde_json::Value,
    ) -> Result<()> {
        let mut agent = self.get(agent_id, tenant_id).await?;
        agent.context = Some(context);
        agent.updated_at = Utc::now();
        self.repo.update(agent).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryAgentRepository;

    fn service() -> AgentService {
        AgentService::new(Arc::new(InMemoryAgentRepository::new()))
    }

    #[tokio::test]
    async fn spawn_drives_agent_to_running() {
        let svc = service();
        let agent = svc
            .create("acme", AgentType::Dev, None, serde_json::Value::Null)
            .await
            .unwrap();
        let running = svc.spawn(agent.id, "acme").await.unwrap();
        assert_eq!(running.status, AgentStatus::Running);

        let err = svc.spawn(agent.id, "acme").await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn terminate_handles_created_and_terminal_agents() {
        let svc = service();
        let fresh = svc
            .create("acme", AgentType::Qa, None, serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(
            svc.terminate(fresh.id, "acme").await.unwrap().status,
            AgentStatus::Terminated
        );

        let done = svc
            .create("acme", AgentType::Qa, None, serde_json::Value::Null)
            .await
            .unwrap();
        svc.spawn(done.id, "acme").await.unwrap();
        svc.complete(done.id, "acme").await.unwrap();
        assert_eq!(
            svc.terminate(done.id, "acme").await.unwrap().status,
            AgentStatus::Completed
        );
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let svc = service();
        let agent = svc
            .create("acme", AgentType::Planner, None, serde_json::Value::Null)
            .await
            .unwrap();
        assert!(matches!(
            svc.get(agent.id, "globex").await,
            Err(AgentError::NotFound { .. })
        ));
        assert_eq!(svc.list("acme", None).await.unwrap().len(), 1);
        assert!(svc.list("globex", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn heartbeat_and_context_are_recorded() {
        let svc = service();
        let agent = svc
            .create("acme", AgentType::Dev, None, serde_json::Value::Null)
            .await
            .unwrap();
        svc.heartbeat(agent.id, "acme").await.unwrap();
        svc.set_context(agent.id, "acme", serde_json::json!({"step": 2}))
            .await
            .unwrap();

        let stored = svc.get(agent.id, "acme").await.unwrap();
        assert!(stored.last_heartbeat.is_some());
        assert_eq!(stored.context, Some(serde_json::json!({"step": 2})));
    }
}
