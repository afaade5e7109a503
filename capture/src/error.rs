use thiserror::Error;

/// Per spec §7's taxonomy: protocol/data-integrity errors are fatal for the
/// current capture session (the caller exits so a supervisor can restart
/// from persisted state); transient infrastructure errors are handled
/// internally via `common::retry::Backoff` and never reach this type.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("replication slot {0} does not exist on the primary")]
    MissingSlot(String),

    #[error("malformed replication frame: {0}")]
    MalformedFrame(String),

    #[error("unknown relation referenced by row event: {0}")]
    UnknownRelation(String),

    #[error("position error: {0}")]
    Position(#[from] kasho_position::PositionError),

    #[error("model error: {0}")]
    Model(#[from] kasho_model::ModelError),

    #[error("postgres connection error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("capture channel closed")]
    ChannelClosed,
}
