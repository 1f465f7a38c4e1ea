// =============================================================================
// Chart Pipeline — snapshot / live merge for one watched pair
// =============================================================================
//
// Owns the candle store, the price history and the indicator engine for the
// active (symbol, interval). All mutation goes through here, on the session
// task, so there is exactly one writer.
//
// Ordering:
//   * Live ticks that arrive before the historical snapshot are buffered and
//     replayed once it lands. Consecutive updates to the same bar coalesce.
//   * A snapshot for a different key than the active one is discarded.
//   * A snapshot arriving after the pipeline is already live is discarded so
//     it cannot overwrite newer live state.
//   * A resync (same pair, new stream) keeps candles and price samples until
//     the fresh snapshot replaces them.
// =============================================================================

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::indicators::{IndicatorEngine, IndicatorSettings};
use crate::market_data::{ApplyOutcome, CandleStore, LiveTick, PriceHistory};
use crate::render::RenderSink;
use crate::types::{Candle, CandleKey, ChartPoint, PriceSample, RenderEvent, SeriesId};

/// Upper bound on distinct bars held while waiting for the snapshot.
const MAX_PENDING_BARS: usize = 1000;

#[derive(Debug)]
enum Phase {
    AwaitingSnapshot { pending: Vec<LiveTick> },
    Live,
}

/// What happened to a historical snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Loaded `bars` candles (0 on fetch failure) and replayed `replayed`
    /// buffered ticks.
    Loaded { bars: usize, replayed: usize },
    /// Requested for a pair that is no longer active.
    StaleKey,
    /// The pipeline was already live.
    AlreadyLive,
}

/// What happened to a live tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Buffered,
    Applied(ApplyOutcome),
}

#[derive(Debug)]
pub struct ChartPipeline {
    key: CandleKey,
    phase: Phase,
    store: CandleStore,
    prices: PriceHistory,
    indicators: IndicatorEngine,
}

impl ChartPipeline {
    pub fn new(key: CandleKey, settings: IndicatorSettings, price_retention_secs: i64) -> Self {
        Self {
            key,
            phase: Phase::AwaitingSnapshot { pending: Vec::new() },
            store: CandleStore::new(),
            prices: PriceHistory::new(price_retention_secs),
            indicators: IndicatorEngine::new(settings),
        }
    }

    pub fn key(&self) -> &CandleKey {
        &self.key
    }

    pub fn candles(&self) -> &[Candle] {
        self.store.candles()
    }

    pub fn indicators(&self) -> &IndicatorEngine {
        &self.indicators
    }

    /// Start watching `key`: drop every candle, price sample and indicator
    /// value of the previous pair and blank the chart.
    pub fn switch(&mut self, key: CandleKey, sink: &mut impl RenderSink) {
        info!(from = %self.key, to = %key, "switching chart pair");
        self.key = key;
        self.phase = Phase::AwaitingSnapshot { pending: Vec::new() };
        self.store.clear();
        self.prices.reset();
        self.indicators.reset();
        self.emit_all(sink);
    }

    /// Wait for a fresh snapshot of the same pair without clearing anything.
    pub fn resync(&mut self) {
        info!(key = %self.key, "resyncing chart pair");
        self.phase = Phase::AwaitingSnapshot { pending: Vec::new() };
    }

    /// Swap the indicator set and redraw every enabled series from the
    /// current candles. Series that were switched off are cleared.
    ///
    /// Returns `false` when the settings are unchanged.
    pub fn set_indicators(&mut self, settings: IndicatorSettings, sink: &mut impl RenderSink) -> bool {
        if *self.indicators.settings() == settings {
            return false;
        }
        let previous = self.indicators.enabled_series();
        self.indicators = IndicatorEngine::new(settings);

        let enabled = self.indicators.enabled_series();
        for id in previous.into_iter().filter(|id| !enabled.contains(id)) {
            sink.set_series(id, Vec::new());
        }
        self.indicators.load(self.store.candles(), sink);
        info!(key = %self.key, series = ?enabled, "indicator set changed");
        true
    }

    /// Apply the historical fetch result requested for `key`.
    ///
    /// A failed fetch loads as an empty series. Buffered live ticks are
    /// replayed on top either way.
    pub fn on_snapshot(
        &mut self,
        key: &CandleKey,
        result: Result<Vec<Candle>>,
        sink: &mut impl RenderSink,
    ) -> SnapshotOutcome {
        if *key != self.key {
            debug!(requested = %key, active = %self.key, "discarding snapshot for inactive pair");
            return SnapshotOutcome::StaleKey;
        }
        let pending = match &mut self.phase {
            Phase::Live => {
                debug!(key = %key, "discarding late snapshot, pipeline already live");
                return SnapshotOutcome::AlreadyLive;
            }
            Phase::AwaitingSnapshot { pending } => std::mem::take(pending),
        };

        let candles = result.unwrap_or_else(|e| {
            warn!(key = %key, error = %e, "historical fetch failed, starting from an empty series");
            Vec::new()
        });

        self.store.load_historical(candles);
        self.phase = Phase::Live;

        sink.set_series(SeriesId::Candles, self.store.candles().iter().map(|c| ChartPoint::Candle(*c)).collect());
        sink.set_series(SeriesId::Volume, self.store.candles().iter().map(ChartPoint::volume_of).collect());
        self.indicators.load(self.store.candles(), sink);

        // After a resync the tracker already holds tick samples; only bars
        // newer than those are seeded.
        let seeded_after = self.prices.latest().map(|s| s.time);
        for candle in self.store.candles() {
            if seeded_after.map_or(true, |t| candle.time > t) {
                self.prices.record(candle.time, candle.close);
            }
        }

        let bars = self.store.candles().len();
        let replayed = pending.len();
        for tick in pending {
            self.apply(tick, sink);
        }

        info!(key = %key, bars, replayed, "historical snapshot loaded");
        SnapshotOutcome::Loaded { bars, replayed }
    }

    /// Merge one live tick, or hold it until the snapshot lands.
    pub fn on_tick(&mut self, tick: LiveTick, sink: &mut impl RenderSink) -> TickOutcome {
        if let Phase::AwaitingSnapshot { pending } = &mut self.phase {
            match pending.last_mut() {
                Some(last) if last.candle.time == tick.candle.time => *last = tick,
                _ => {
                    if pending.len() >= MAX_PENDING_BARS {
                        warn!(key = %self.key, "pending live buffer full, dropping oldest bar");
                        pending.remove(0);
                    }
                    pending.push(tick);
                }
            }
            return TickOutcome::Buffered;
        }
        TickOutcome::Applied(self.apply(tick, sink))
    }

    fn apply(&mut self, tick: LiveTick, sink: &mut impl RenderSink) -> ApplyOutcome {
        let candle = tick.candle;
        let outcome = self.store.apply_live_update(candle);
        if !outcome.is_accepted() {
            return outcome;
        }

        sink.update_point(SeriesId::Candles, ChartPoint::Candle(candle));
        sink.update_point(SeriesId::Volume, ChartPoint::volume_of(&candle));
        self.indicators.apply(&candle, outcome, sink);
        self.prices.record(tick.event_time, candle.close);
        outcome
    }

    /// Close of the most recent bar.
    pub fn current_price(&self) -> Option<PriceSample> {
        self.store.last().map(|c| PriceSample {
            time: c.time,
            price: c.close,
        })
    }

    /// Price `lag` seconds before `now`, per the price history lookup.
    pub fn price_before(&self, now: i64, lag: i64) -> Option<PriceSample> {
        self.prices.price_before(now, lag)
    }

    /// Every series in full, for a chart that has just connected.
    pub fn snapshot(&self) -> Vec<RenderEvent> {
        let mut events = Vec::new();
        self.emit_all(&mut events);
        events
    }

    #[cfg(test)]
    pub fn is_live(&self) -> bool {
        matches!(self.phase, Phase::Live)
    }

    #[cfg(test)]
    pub fn prices(&self) -> &PriceHistory {
        &self.prices
    }

    fn emit_all(&self, sink: &mut impl RenderSink) {
        sink.set_series(SeriesId::Candles, self.store.candles().iter().map(|c| ChartPoint::Candle(*c)).collect());
        sink.set_series(SeriesId::Volume, self.store.candles().iter().map(ChartPoint::volume_of).collect());
        self.indicators.emit_all(sink);
    }
}
