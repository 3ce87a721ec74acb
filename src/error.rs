use thiserror::Error;

pub type BlockTreeResult<T, E = BlockTreeError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum BlockTreeError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
}
