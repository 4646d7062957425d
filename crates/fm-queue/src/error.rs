use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Agent(#[from] fm_agents::AgentError),
    #[error(transparent)]
    Context(#[from] fm_context::ContextError),
    #[error("invalid job payload: {0}")]
    InvalidPayload(String),
    #[error("unknown job: {0}")]
    UnknownJob(Uuid),
    #[error("job {id} failed after {attempts} attempt(s): {error}")]
    Exhausted { id: Uuid, attempts: u32, error: String },
}

pub type Result<T> = std::result::Result<T, JobError>;
