use thiserror::Error;

#[derive(Debug, Error)]
pub enum DialectError {
    #[error("invalid DML: {0}")]
    InvalidDml(String),
}

impl From<kasho_model::ModelError> for DialectError {
    fn from(err: kasho_model::ModelError) -> Self {
        DialectError::InvalidDml(err.to_string())
    }
}
