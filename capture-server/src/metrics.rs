use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::RwLock;

/// Counters `GetStatus` reports alongside the bootstrap state, per
/// SPEC_FULL.md's supplement to spec's `CaptureStatus` (`events_captured_total`,
/// `last_event_at`), grounded on the teacher's own binlog-reader monitoring
/// counters.
pub struct Metrics {
    events_captured_total: AtomicU64,
    connected_clients: AtomicU32,
    last_event_at: RwLock<Option<String>>,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_captured_total: AtomicU64::new(0),
            connected_clients: AtomicU32::new(0),
            last_event_at: RwLock::new(None),
            start_time: Instant::now(),
        }
    }

    pub async fn record_event(&self, at: String) {
        self.events_captured_total.fetch_add(1, Ordering::Relaxed);
        *self.last_event_at.write().await = Some(at);
    }

    pub fn events_captured_total(&self) -> u64 {
        self.events_captured_total.load(Ordering::Relaxed)
    }

    pub async fn last_event_at(&self) -> String {
        self.last_event_at.read().await.clone().unwrap_or_default()
    }

    pub fn client_connected(&self) {
        self.connected_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        self.connected_clients.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connected_clients(&self) -> u32 {
        self.connected_clients.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
