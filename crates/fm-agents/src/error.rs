use fm_core::types::AgentType;
use uuid::Uuid;

use crate::agent::AgentStatus;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: AgentStatus, to: AgentStatus },
    #[error("agent not found: {agent_id} (tenant {tenant_id})")]
    NotFound { agent_id: Uuid, tenant_id: String },
    #[error("agent already exists: {0}")]
    AlreadyExists(Uuid),
    #[error("no runner registered for agent type {0}")]
    NoRunner(AgentType),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("execution timed out after {0}s")]
    Timeout(u64),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
