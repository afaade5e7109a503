//! Long-lived readers of a primary's replication stream. Two engines, one
//! contract: decode a lossless, ordered sequence of `kasho_model::Change`
//! values tagged with a `kasho_position::Position`, per spec.md §4.5/§4.6.
//!
//! Generalizes the teacher's `Server`/`ShutdownHandle` cooperative-shutdown
//! shape to a single cross-engine trait: `connect` opens the replication
//! session, `run` streams decoded changes onto a channel until cancelled,
//! `current_position` is read by the status RPC and the standby-status
//! ticker without blocking the capture loop.

mod error;
mod mysql;
mod pg;

pub use error::CaptureError;
pub use mysql::MySqlCapture;
pub use pg::PgCapture;

use std::sync::Arc;

use async_trait::async_trait;
use kasho_model::Change;
use kasho_position::Position;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

/// Shared, lock-guarded cursor: readers (the status RPC, the 10s PG
/// standby-status ticker) take a read lock; only the capture loop itself
/// ever writes it, per spec §5.
#[derive(Clone)]
pub struct CurrentPosition(Arc<RwLock<Position>>);

impl CurrentPosition {
    pub fn new(initial: Position) -> Self {
        Self(Arc::new(RwLock::new(initial)))
    }

    pub async fn get(&self) -> Position {
        self.0.read().await.clone()
    }

    pub(crate) async fn set(&self, position: Position) {
        *self.0.write().await = position;
    }
}

#[async_trait]
pub trait Capture: Send {
    /// Opens the connection(s) to the primary and validates prerequisites
    /// (replication slot existence for PG; nothing blocking for MySQL,
    /// since `IncludeTableRegex` scoping happens at decode time).
    async fn connect(&mut self) -> Result<(), CaptureError>;

    /// Streams decoded changes onto `tx` until `cancel` fires or a
    /// protocol/data-integrity error occurs. Transient infrastructure
    /// errors (connection drop) are retried internally with backoff and
    /// never surface here; only fatal errors return `Err`, per spec §7.
    async fn run(&mut self, tx: mpsc::Sender<Change>, cancel: CancellationToken) -> Result<(), CaptureError>;

    fn current_position(&self) -> CurrentPosition;

    async fn shutdown(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn current_position_reflects_latest_set() {
        let cursor = CurrentPosition::new(Position::Pg(0));
        cursor.set(Position::Pg(100)).await;
        assert_eq!(cursor.get().await, Position::Pg(100));
    }
}
