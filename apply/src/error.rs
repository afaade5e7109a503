use thiserror::Error;

/// Per spec §7: one enum at this crate's boundary. Stop-on-error checks
/// `is_recoverable()` to decide whether a failure is survivable (log and
/// continue) or fatal for the process.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("transform error: {0}")]
    Transform(#[from] kasho_transform::TransformError),

    #[error("dialect error: {0}")]
    Dialect(#[from] kasho_dialect::DialectError),

    #[error("model error: {0}")]
    Model(#[from] kasho_model::ModelError),

    #[error("position error: {0}")]
    Position(#[from] kasho_position::PositionError),

    #[error("sql error applying change to {table}: {source}")]
    Sql {
        table: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("grpc transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("grpc status error: {0}")]
    Status(#[from] tonic::Status),

    #[error("unsupported replica dialect: {0}")]
    UnsupportedDialect(String),
}

impl ApplyError {
    /// SQL errors are the only kind `main`'s loop survives by default (log
    /// and advance, per spec §7's "current policy"); everything else —
    /// malformed wire data, an unrenderable change, a dropped client — is
    /// fatal for the process so a supervisor can restart it.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ApplyError::Sql { .. })
    }
}
