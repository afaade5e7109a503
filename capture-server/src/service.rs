//! Implements `kasho_proto::capture_service_server::CaptureService`: the
//! wire seam between the bootstrap coordinator/ordered buffer and every
//! downstream consumer, per spec §4.7.

use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use futures::{Stream, StreamExt};
use kasho_bootstrap::{BootstrapState as NativeBootstrapState, StateMachine};
use kasho_buffer::BufferClient;
use kasho_capture::CurrentPosition;
use kasho_position::Position;
use kasho_proto::capture_service_server::CaptureService;
use kasho_proto::{
    BootstrapState as WireBootstrapState, BootstrapStatus, CaptureStatus, ChangeEnvelope,
    CompleteBootstrapRequest, GetStatusRequest, StartBootstrapRequest, StreamRequest,
};
use tonic::{Request, Response, Status};

use crate::metrics::Metrics;

const CATCH_UP_PAGE_SIZE: usize = 1000;

fn to_wire_state(state: NativeBootstrapState) -> WireBootstrapState {
    match state {
        NativeBootstrapState::Waiting => WireBootstrapState::Waiting,
        NativeBootstrapState::Accumulating => WireBootstrapState::Accumulating,
        NativeBootstrapState::Streaming => WireBootstrapState::Streaming,
    }
}

pub struct CaptureServiceImpl {
    buffer: Arc<BufferClient>,
    state_machine: Arc<StateMachine>,
    /// Cloned once at startup, independent of the capture loop's own
    /// `Arc<AsyncMutex<Box<dyn Capture>>>` — `Supervisor::start` holds that
    /// mutex for the entire lifetime of `Capture::run`, so reading the
    /// current position through it would block `GetStatus` for as long as
    /// capture is actually running (i.e. always, outside WAITING).
    position: CurrentPosition,
    metrics: Arc<Metrics>,
}

impl CaptureServiceImpl {
    pub fn new(
        buffer: Arc<BufferClient>,
        state_machine: Arc<StateMachine>,
        position: CurrentPosition,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            buffer,
            state_machine,
            position,
            metrics,
        }
    }
}

#[tonic::async_trait]
impl CaptureService for CaptureServiceImpl {
    type StreamStream = Pin<Box<dyn Stream<Item = Result<ChangeEnvelope, Status>> + Send + 'static>>;

    async fn stream(&self, request: Request<StreamRequest>) -> Result<Response<Self::StreamStream>, Status> {
        let last_position = request.into_inner().last_position;
        let start = if last_position.is_empty() {
            Position::Pg(0)
        } else {
            Position::parse(&last_position).map_err(|err| Status::invalid_argument(err.to_string()))?
        };

        let state_machine = Arc::clone(&self.state_machine);
        let buffer = Arc::clone(&self.buffer);
        let metrics = Arc::clone(&self.metrics);

        metrics.client_connected();
        let disconnect_metrics = Arc::clone(&metrics);

        let output = stream! {
            let cancel = tokio_util::sync::CancellationToken::new();
            state_machine.wait_until_streaming(&cancel).await;

            let mut offset = 0usize;
            loop {
                match buffer.get_changes_after(&start, offset, CATCH_UP_PAGE_SIZE).await {
                    Ok(page) if page.is_empty() => break,
                    Ok(page) => {
                        let count = page.len();
                        for change_json in page {
                            yield Ok(ChangeEnvelope { change_json });
                        }
                        offset += count;
                    }
                    Err(err) => {
                        yield Err(Status::internal(err.to_string()));
                        return;
                    }
                }
            }

            match buffer.subscribe().await {
                Ok(mut live) => {
                    while let Some(change_json) = live.next().await {
                        yield Ok(ChangeEnvelope { change_json });
                    }
                }
                Err(err) => {
                    yield Err(Status::internal(err.to_string()));
                }
            }

            disconnect_metrics.client_disconnected();
        };

        Ok(Response::new(Box::pin(output)))
    }

    async fn start_bootstrap(
        &self,
        request: Request<StartBootstrapRequest>,
    ) -> Result<Response<BootstrapStatus>, Status> {
        let start_position = request.into_inner().start_position;
        match self.state_machine.start_bootstrap(start_position).await {
            Ok(state) => Ok(Response::new(BootstrapStatus {
                previous_state: WireBootstrapState::Waiting as i32,
                current_state: to_wire_state(state.state) as i32,
                accumulated_changes: state.accumulated_changes,
                ready_to_stream: false,
            })),
            Err(kasho_bootstrap::BootstrapError::IllegalTransition { previous, current }) => {
                Err(Status::failed_precondition(format!(
                    "cannot start bootstrap from {previous:?} (currently {current:?})"
                )))
            }
            Err(err) => Err(Status::internal(err.to_string())),
        }
    }

    async fn complete_bootstrap(
        &self,
        _request: Request<CompleteBootstrapRequest>,
    ) -> Result<Response<BootstrapStatus>, Status> {
        match self.state_machine.complete_bootstrap().await {
            Ok(state) => Ok(Response::new(BootstrapStatus {
                previous_state: WireBootstrapState::Accumulating as i32,
                current_state: to_wire_state(state.state) as i32,
                accumulated_changes: state.accumulated_changes,
                ready_to_stream: true,
            })),
            Err(kasho_bootstrap::BootstrapError::IllegalTransition { previous, current }) => {
                Err(Status::failed_precondition(format!(
                    "cannot complete bootstrap from {previous:?} (currently {current:?})"
                )))
            }
            Err(err) => Err(Status::internal(err.to_string())),
        }
    }

    async fn get_status(&self, _request: Request<GetStatusRequest>) -> Result<Response<CaptureStatus>, Status> {
        let state = self.state_machine.current().await;
        let current_position = self.position.get().await.format();

        Ok(Response::new(CaptureStatus {
            state: to_wire_state(state.state) as i32,
            start_position: state.start_position.unwrap_or_default(),
            current_position,
            accumulated_changes: state.accumulated_changes,
            connected_clients: self.metrics.connected_clients(),
            uptime_seconds: self.metrics.uptime_seconds(),
            events_captured_total: self.metrics.events_captured_total(),
            last_event_at: self.metrics.last_event_at().await,
        }))
    }
}
