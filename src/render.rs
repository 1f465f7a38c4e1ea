// =============================================================================
// Render Sink — where finished series and tail updates go
// =============================================================================

use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{ChartPoint, RenderEvent, SeriesId};

/// Consumer of chart series: bulk replace or single tail append/replace
/// (keyed by the point's time).
pub trait RenderSink {
    fn set_series(&mut self, series: SeriesId, points: Vec<ChartPoint>);
    fn update_point(&mut self, series: SeriesId, point: ChartPoint);
}

/// Collects events in order; used to build snapshots.
impl RenderSink for Vec<RenderEvent> {
    fn set_series(&mut self, series: SeriesId, points: Vec<ChartPoint>) {
        self.push(RenderEvent::SetSeries { series, points });
    }

    fn update_point(&mut self, series: SeriesId, point: ChartPoint) {
        self.push(RenderEvent::UpdatePoint { series, point });
    }
}

/// Fans render events out to every connected chart client.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<RenderEvent>,
}

impl BroadcastSink {
    pub fn new(tx: broadcast::Sender<RenderEvent>) -> Self {
        Self { tx }
    }

    fn publish(&self, event: RenderEvent) {
        // No subscribers is fine: nobody is looking at the chart.
        if self.tx.send(event).is_err() {
            trace!("render event dropped, no chart clients");
        }
    }
}

impl RenderSink for BroadcastSink {
    fn set_series(&mut self, series: SeriesId, points: Vec<ChartPoint>) {
        self.publish(RenderEvent::SetSeries { series, points });
    }

    fn update_point(&mut self, series: SeriesId, point: ChartPoint) {
        self.publish(RenderEvent::UpdatePoint { series, point });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IndicatorPoint;

    #[test]
    fn broadcast_sink_delivers_to_subscribers() {
        let (tx, mut rx) = broadcast::channel(8);
        let mut sink = BroadcastSink::new(tx);
        let point = ChartPoint::Line(IndicatorPoint { time: 1, value: 2.0 });
        sink.update_point(SeriesId::Ema, point);

        let ev = rx.try_recv().unwrap();
        assert_eq!(ev, RenderEvent::UpdatePoint { series: SeriesId::Ema, point });
    }

    #[test]
    fn broadcast_sink_without_subscribers_does_not_panic() {
        let (tx, rx) = broadcast::channel(8);
        drop(rx);
        let mut sink = BroadcastSink::new(tx);
        sink.set_series(SeriesId::Candles, Vec::new());
    }
}
