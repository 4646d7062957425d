#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("serialization: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("archive io: {0}")]
    Archive(#[from] std::io::Error),
    #[error("active cache unavailable: {0}")]
    Cache(String),
    #[error("invalid storage key: {0}")]
    InvalidKey(String),
    #[error("corrupt snapshot row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, ContextError>;
