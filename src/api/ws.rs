// =============================================================================
// WebSocket Handler — chart render feed
// =============================================================================
//
// Clients connect to `/api/v1/ws` and receive:
//   1. One `set_series` event per series, rebuilding the whole chart.
//   2. Every subsequent `RenderEvent` as a JSON text frame.
//
// The broadcast is subscribed to before the snapshot is requested, so nothing
// falls in between. Updates queued before the snapshot was taken are already
// part of it; those older than the snapshot's last point of their series are
// dropped so a bar that has since rolled over is not rewritten. A client that
// lags behind the broadcast gets a fresh snapshot instead of the events it
// missed.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::types::{RenderEvent, SeriesId};

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let clients = state.client_connected();
    info!(clients, "chart client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut events = state.render_tx.subscribe();

    let mut guard = match send_snapshot(&mut sender, &state).await {
        Ok(guard) => guard,
        Err(e) => {
            warn!(error = %e, "failed to send initial chart snapshot");
            cleanup(&state);
            return;
        }
    };

    loop {
        tokio::select! {
            // ── Push: forward render events ─────────────────────────────
            event = events.recv() => {
                let sent = match event {
                    Ok(event) if guard.admit(&event) => send_event(&mut sender, &event).await,
                    Ok(_) => Ok(()),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "chart client lagged, resending snapshot");
                        send_snapshot(&mut sender, &state).await.map(|fresh| guard = fresh)
                    }
                    Err(RecvError::Closed) => {
                        info!("render feed closed");
                        break;
                    }
                };
                if let Err(e) = sent {
                    debug!(error = %e, "WebSocket send failed, disconnecting");
                    break;
                }
            }

            // ── Recv: control frames only ───────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send Pong, disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error, disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    cleanup(&state);
}

/// Send the full chart as `set_series` events.
async fn send_snapshot<S>(sender: &mut S, state: &Arc<AppState>) -> anyhow::Result<ReplayGuard>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let snapshot = state.session.snapshot().await?;
    debug!(key = %snapshot.key, events = snapshot.events.len(), "sending chart snapshot");
    for event in &snapshot.events {
        send_event(sender, event).await?;
    }
    Ok(ReplayGuard::after_snapshot(&snapshot.events))
}

/// Filters broadcast events queued before a snapshot was taken.
#[derive(Debug, Default)]
struct ReplayGuard {
    /// Last point time per series as the client last saw it in full.
    floors: HashMap<SeriesId, i64>,
}

impl ReplayGuard {
    fn after_snapshot(events: &[RenderEvent]) -> Self {
        let floors = events
            .iter()
            .filter_map(|ev| match ev {
                RenderEvent::SetSeries { series, points } => points.last().map(|p| (*series, p.time())),
                RenderEvent::UpdatePoint { .. } => None,
            })
            .collect();
        Self { floors }
    }

    /// Whether `event` should reach the client.
    fn admit(&mut self, event: &RenderEvent) -> bool {
        match event {
            RenderEvent::SetSeries { series, .. } => {
                self.floors.remove(series);
                true
            }
            RenderEvent::UpdatePoint { series, point } => {
                self.floors.get(series).map_or(true, |&floor| point.time() >= floor)
            }
        }
    }
}

async fn send_event<S>(sender: &mut S, event: &RenderEvent) -> anyhow::Result<()>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let json = serde_json::to_string(event)?;
    sender.send(Message::Text(json)).await?;
    Ok(())
}

fn cleanup(state: &Arc<AppState>) {
    let clients = state.client_disconnected();
    info!(clients, "chart client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Candle, ChartPoint};

    fn candle_at(time: i64, close: f64) -> ChartPoint {
        ChartPoint::Candle(Candle::new(time, close, close, close, close, 1.0))
    }

    fn update(time: i64, close: f64) -> RenderEvent {
        RenderEvent::UpdatePoint { series: SeriesId::Candles, point: candle_at(time, close) }
    }

    #[test]
    fn updates_older_than_snapshot_bar_are_skipped() {
        let snapshot = vec![RenderEvent::SetSeries {
            series: SeriesId::Candles,
            points: vec![candle_at(0, 1.0), candle_at(60, 2.0), candle_at(120, 3.0)],
        }];
        let mut guard = ReplayGuard::after_snapshot(&snapshot);

        // Queued before the snapshot: revision of the bar that rolled over.
        assert!(!guard.admit(&update(60, 2.5)));
        assert!(guard.admit(&update(120, 3.1)));
        assert!(guard.admit(&update(180, 4.0)));
    }

    #[test]
    fn set_series_lifts_the_floor_for_that_series_only() {
        let snapshot = vec![
            RenderEvent::SetSeries { series: SeriesId::Candles, points: vec![candle_at(120, 3.0)] },
            RenderEvent::SetSeries { series: SeriesId::Volume, points: vec![ChartPoint::Volume { time: 120, value: 1.0, down: false }] },
        ];
        let mut guard = ReplayGuard::after_snapshot(&snapshot);

        // A pair switch blanks the chart and starts over from earlier times.
        assert!(guard.admit(&RenderEvent::SetSeries { series: SeriesId::Candles, points: Vec::new() }));
        assert!(guard.admit(&update(0, 9.0)));

        let old_volume = RenderEvent::UpdatePoint {
            series: SeriesId::Volume,
            point: ChartPoint::Volume { time: 60, value: 1.0, down: true },
        };
        assert!(!guard.admit(&old_volume));
    }

    #[test]
    fn empty_snapshot_admits_everything() {
        let snapshot = vec![RenderEvent::SetSeries { series: SeriesId::Candles, points: Vec::new() }];
        let mut guard = ReplayGuard::after_snapshot(&snapshot);
        assert!(guard.admit(&update(0, 1.0)));
    }
}
