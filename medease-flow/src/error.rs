use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Classification failed: {0}")]
    ClassificationFailed(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for FlowError {
    fn from(e: sqlx::Error) -> Self {
        FlowError::StorageError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
