use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("unknown failure: {0}")]
    UnknownFailure(Uuid),
    #[error("session runtime: {0}")]
    Runtime(String),
    #[error("pipeline control: {0}")]
    Pipeline(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<fm_queue::JobError> for RecoveryError {
    fn from(e: fm_queue::JobError) -> Self {
        RecoveryError::Runtime(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RecoveryError>;
