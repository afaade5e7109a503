//! WAITING -> ACCUMULATING -> STREAMING bootstrap coordinator. State is
//! held behind a single mutex (same shape as the teacher's
//! `RelayLogServerMachine` singleton) and persisted inside the critical
//! section, with rollback on persist failure.

use std::sync::Arc;
use std::time::Duration;

use kasho_buffer::BufferClient;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const STATE_KEY: &str = "kasho:change-stream:state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapState {
    Waiting,
    Accumulating,
    Streaming,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    #[serde(rename = "current")]
    pub state: BootstrapState,
    #[serde(rename = "start_lsn")]
    pub start_position: Option<String>,
    pub transition_time: String,
    pub accumulated_changes: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            state: BootstrapState::Waiting,
            start_position: None,
            transition_time: chrono::Utc::now().to_rfc3339(),
            accumulated_changes: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("illegal transition: previous_state={previous:?}, current_state={current:?}")]
    IllegalTransition {
        previous: BootstrapState,
        current: BootstrapState,
    },
    #[error("bootstrap buffer error: {0}")]
    Buffer(#[from] kasho_buffer::BufferError),
    #[error("bootstrap state serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Persists and serializes every state transition behind one mutex, per
/// spec §4.4/§5. `wait_until_streaming` is the `Stream` RPC's blocking
/// gate.
pub struct StateMachine {
    state: Arc<Mutex<State>>,
    buffer: Arc<BufferClient>,
}

impl StateMachine {
    /// Loads persisted state from the KV store, defaulting to WAITING if
    /// absent (cold start), per §4.4.
    pub async fn load(buffer: Arc<BufferClient>) -> Result<Self, BootstrapError> {
        let state = match buffer.get_state(STATE_KEY).await? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => State::default(),
        };
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            buffer,
        })
    }

    pub async fn current(&self) -> State {
        self.state.lock().await.clone()
    }

    pub async fn start_bootstrap(&self, start_position: String) -> Result<State, BootstrapError> {
        let mut guard = self.state.lock().await;
        if guard.state != BootstrapState::Waiting {
            return Err(BootstrapError::IllegalTransition {
                previous: guard.state,
                current: guard.state,
            });
        }
        let previous = guard.clone();
        guard.state = BootstrapState::Accumulating;
        guard.start_position = Some(start_position);
        guard.accumulated_changes = 0;
        guard.transition_time = chrono::Utc::now().to_rfc3339();
        if let Err(err) = self.persist(&guard).await {
            warn!(error = %err, "failed to persist bootstrap start, rolling back");
            *guard = previous;
            return Err(err);
        }
        info!(start_position = ?guard.start_position, "bootstrap accumulation started");
        Ok(guard.clone())
    }

    pub async fn complete_bootstrap(&self) -> Result<State, BootstrapError> {
        let mut guard = self.state.lock().await;
        if guard.state != BootstrapState::Accumulating {
            return Err(BootstrapError::IllegalTransition {
                previous: guard.state,
                current: guard.state,
            });
        }
        let previous = guard.clone();
        guard.state = BootstrapState::Streaming;
        guard.transition_time = chrono::Utc::now().to_rfc3339();
        if let Err(err) = self.persist(&guard).await {
            warn!(error = %err, "failed to persist bootstrap completion, rolling back");
            *guard = previous;
            return Err(err);
        }
        info!("bootstrap complete, now streaming");
        Ok(guard.clone())
    }

    /// Operator reset, valid from any state.
    pub async fn reset(&self) -> Result<State, BootstrapError> {
        let mut guard = self.state.lock().await;
        let previous = guard.clone();
        *guard = State::default();
        if let Err(err) = self.persist(&guard).await {
            *guard = previous;
            return Err(err);
        }
        warn!("bootstrap state reset to WAITING by operator");
        Ok(guard.clone())
    }

    /// Bumps the accumulated-changes counter while ACCUMULATING; a no-op in
    /// any other state.
    pub async fn record_accumulated(&self, count: u64) -> Result<(), BootstrapError> {
        let mut guard = self.state.lock().await;
        if guard.state != BootstrapState::Accumulating {
            return Ok(());
        }
        let previous = guard.clone();
        guard.accumulated_changes += count;
        if let Err(err) = self.persist(&guard).await {
            *guard = previous;
            return Err(err);
        }
        Ok(())
    }

    async fn persist(&self, state: &State) -> Result<(), BootstrapError> {
        let bytes = serde_json::to_vec(state)?;
        self.buffer.set_state(STATE_KEY, &bytes).await?;
        Ok(())
    }

    /// Blocks, polling every 100ms, until state == STREAMING or `cancel`
    /// fires.
    pub async fn wait_until_streaming(&self, cancel: &CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_millis(100));
        loop {
            if self.current().await.state == BootstrapState::Streaming {
                return;
            }
            tokio::select! {
                _ = interval.tick() => {}
                _ = cancel.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_is_waiting() {
        let state = State::default();
        assert_eq!(state.state, BootstrapState::Waiting);
        assert_eq!(state.accumulated_changes, 0);
    }
}
