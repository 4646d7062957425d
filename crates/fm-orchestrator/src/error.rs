use fm_core::types::WorkflowPhase;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Job(#[from] fm_queue::JobError),
    #[error(transparent)]
    Agent(#[from] fm_agents::AgentError),
    #[error(transparent)]
    Context(#[from] fm_context::ContextError),
    #[error(transparent)]
    Recovery(#[from] fm_recovery::RecoveryError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("{job_type} job {job_id} failed: {error}")]
    JobFailed {
        job_id: Uuid,
        job_type: String,
        error: String,
    },
    #[error("unexpected {phase} result: {reason}")]
    BadResult { phase: WorkflowPhase, reason: String },
    #[error("workflow not found: {0}")]
    UnknownWorkflow(Uuid),
    #[error("invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: WorkflowPhase, to: WorkflowPhase },
    #[error("workflow {0} was cancelled")]
    Cancelled(Uuid),
    #[error("invalid task: {0}")]
    InvalidTask(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
