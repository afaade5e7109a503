use thiserror::Error;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("ordered buffer unavailable: {0}")]
    Unavailable(String),
    #[error("invalid position: {0}")]
    InvalidPosition(#[from] kasho_position::PositionError),
}

impl From<redis::RedisError> for BufferError {
    fn from(err: redis::RedisError) -> Self {
        BufferError::Unavailable(err.to_string())
    }
}
