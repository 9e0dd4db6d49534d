use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("datastore is closed")]
    Closed,

    #[error("prompt not found: {0}")]
    PromptNotFound(String),

    #[error("response not found: {0}")]
    ResponseNotFound(String),

    #[error("response {0} is already complete")]
    ResponseFinalized(String),

    #[error("record already exists: {0}")]
    Duplicate(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed record: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
