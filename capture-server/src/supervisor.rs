//! Starts and stops the capture loop as the bootstrap state machine leaves
//! and returns to WAITING, on a single-second tick — the same
//! `Arc<Mutex<ServerState>>` + spawned-task shape as the teacher's
//! `RelayLogServer`, generalized from "always on" to state-bound.
//!
//! Capture itself begins at WAITING -> ACCUMULATING (per spec §4.4, "begin
//! capturing from primary but keep streaming RPC blocked") and keeps
//! running through STREAMING; it is only torn down on an operator reset
//! back to WAITING. See `DESIGN.md`'s Open Question decisions for why this
//! reads spec's two capture-lifecycle sentences (§4.4 vs §4.7) as "runs
//! whenever state != WAITING" rather than literally gating on STREAMING.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::retry::Backoff;
use kasho_bootstrap::{BootstrapState, StateMachine};
use kasho_buffer::BufferClient;
use kasho_capture::Capture;
use kasho_model::Change;
use kasho_position::Position;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::metrics::Metrics;

struct RunningState {
    capture_handle: JoinHandle<()>,
    pump_handle: JoinHandle<()>,
    cancel: CancellationToken,
}

pub struct Supervisor {
    capture: Arc<AsyncMutex<Box<dyn Capture>>>,
    buffer: Arc<BufferClient>,
    state_machine: Arc<StateMachine>,
    metrics: Arc<Metrics>,
    running: AtomicBool,
    handle: std::sync::Mutex<Option<RunningState>>,
}

impl Supervisor {
    pub fn new(
        capture: Arc<AsyncMutex<Box<dyn Capture>>>,
        buffer: Arc<BufferClient>,
        state_machine: Arc<StateMachine>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            capture,
            buffer,
            state_machine,
            metrics,
            running: AtomicBool::new(false),
            handle: std::sync::Mutex::new(None),
        }
    }

    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let target_running = self.state_machine.current().await.state != BootstrapState::Waiting;
            let running = self.running.load(Ordering::SeqCst);
            if target_running && !running {
                self.start().await;
            } else if !target_running && running {
                self.stop().await;
            }
        }
    }

    async fn start(&self) {
        {
            let mut guard = self.capture.lock().await;
            if let Err(err) = guard.connect().await {
                error!(error = %err, "capture failed to connect, will retry next tick");
                return;
            }
        }

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<Change>(1024);

        let capture = Arc::clone(&self.capture);
        let run_cancel = cancel.clone();
        let capture_handle = tokio::spawn(async move {
            let mut guard = capture.lock().await;
            if let Err(err) = guard.run(tx, run_cancel).await {
                error!(error = %err, "capture run loop exited with a fatal error");
            }
        });

        let buffer = Arc::clone(&self.buffer);
        let state_machine = Arc::clone(&self.state_machine);
        let metrics = Arc::clone(&self.metrics);
        let pump_handle = tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                let Ok(position) = Position::parse(&change.position) else {
                    warn!(position = %change.position, "dropping change with unparseable position");
                    continue;
                };
                let Ok(payload) = change.encode() else {
                    warn!("dropping change that failed to serialize");
                    continue;
                };

                // KV unavailability must never drop an event (spec §4.3/§7):
                // retry with the same capped exponential backoff the capture
                // connections use, until the write succeeds.
                let mut backoff = Backoff::capped_30s();
                loop {
                    match buffer.add_change(&position, &payload).await {
                        Ok(()) => break,
                        Err(err) => {
                            let delay = backoff.next();
                            error!(
                                error = %err,
                                position = %change.position,
                                delay_ms = delay.as_millis() as u64,
                                "ordered buffer unavailable, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                    }
                }

                if let Err(err) = state_machine.record_accumulated(1).await {
                    warn!(error = %err, "failed to persist accumulated-changes counter");
                }
                metrics.record_event(chrono::Utc::now().to_rfc3339()).await;
            }
        });

        self.running.store(true, Ordering::SeqCst);
        *self.handle.lock().unwrap() = Some(RunningState { capture_handle, pump_handle, cancel });
        info!("capture loop started");
    }

    async fn stop(&self) {
        let state = self.handle.lock().unwrap().take();
        if let Some(state) = state {
            state.cancel.cancel();
            let _ = state.capture_handle.await;
            let _ = state.pump_handle.await;
        }
        let mut guard = self.capture.lock().await;
        guard.shutdown().await;
        self.running.store(false, Ordering::SeqCst);
        info!("capture loop stopped");
    }
}
