// =============================================================================
// Central Application State — shared by the API handlers
// =============================================================================
//
// The chart itself lives inside the session task; handlers reach it through
// the `SessionHandle`. What sits here is what handlers need without a round
// trip: the render broadcast, the session's published status and the config.
//
// Thread safety:
//   - Atomic counter for connected chart clients.
//   - parking_lot::RwLock for status and configuration.
// =============================================================================

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::runtime_config::ChartConfig;
use crate::session::{SessionHandle, SessionStatus};
use crate::types::RenderEvent;

/// Render events buffered per WebSocket client before it counts as lagging.
pub const RENDER_CHANNEL_CAPACITY: usize = 4096;

/// Shared across all handlers via `Arc<AppState>`.
pub struct AppState {
    // ── Chart session ───────────────────────────────────────────────────
    pub session: SessionHandle,
    pub status: Arc<RwLock<SessionStatus>>,
    pub render_tx: broadcast::Sender<RenderEvent>,

    // ── Configuration ───────────────────────────────────────────────────
    pub config: Arc<RwLock<ChartConfig>>,
    pub config_path: String,

    // ── Clients ─────────────────────────────────────────────────────────
    pub ws_clients: AtomicUsize,

    /// Instant the service started. Used for uptime.
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        session: SessionHandle,
        status: Arc<RwLock<SessionStatus>>,
        render_tx: broadcast::Sender<RenderEvent>,
        config: ChartConfig,
        config_path: impl Into<String>,
    ) -> Self {
        Self {
            session,
            status,
            render_tx,
            config: Arc::new(RwLock::new(config)),
            config_path: config_path.into(),
            ws_clients: AtomicUsize::new(0),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.read().clone()
    }

    /// Register a chart client; returns the new count.
    pub fn client_connected(&self) -> usize {
        self.ws_clients.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the remaining count.
    pub fn client_disconnected(&self) -> usize {
        self.ws_clients.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    pub fn connected_clients(&self) -> usize {
        self.ws_clients.load(Ordering::SeqCst)
    }
}
