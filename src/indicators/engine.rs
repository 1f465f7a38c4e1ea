// =============================================================================
// Indicator Engine — keeps every enabled series aligned with the candles
// =============================================================================
//
// The engine is fed the same sequence of appends / in-place revisions the
// candle store accepts. Each indicator runs as revisable streaming state, so a
// tick costs O(1) amortised in the length of the history while every value
// stays identical to a batch run over the full close series.
//
// Emission is gated on a minimum history of max(enabled periods): below it
// nothing is sent; the tick that crosses it sends every series in full, and
// after that only the tail point per series is sent.
// =============================================================================

use tracing::{debug, warn};

use super::ema::Ema;
use super::macd::Macd;
use super::rsi::Rsi;
use super::sma::Sma;
use super::{Revisable, StreamingIndicator};
use crate::market_data::ApplyOutcome;
use crate::render::RenderSink;
use crate::types::{Candle, ChartPoint, IndicatorPoint, MacdValue, SeriesId};

/// Periods for one MACD instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacdParams {
    pub fast: usize,
    pub slow: usize,
    pub signal: usize,
}

/// Which indicators run, and with what periods. `None` disables one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndicatorSettings {
    pub rsi: Option<usize>,
    pub ema: Option<usize>,
    pub sma: Option<usize>,
    pub macd: Option<MacdParams>,
}

impl IndicatorSettings {
    /// Minimum number of candles before any indicator point is emitted.
    pub fn min_history(&self) -> usize {
        [
            self.rsi,
            self.ema,
            self.sma,
            self.macd.map(|m| m.fast.max(m.slow)),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Per-indicator track
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Track<I: StreamingIndicator> {
    template: I,
    state: Revisable<I>,
    points: Vec<(i64, I::Output)>,
}

impl<I: StreamingIndicator> Track<I> {
    fn new(indicator: I) -> Self {
        Self {
            state: Revisable::new(indicator.clone()),
            template: indicator,
            points: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.state = Revisable::new(self.template.clone());
        self.points.clear();
    }

    /// Rebuild from a whole series. Points come from the batch form; the
    /// streaming state replays every close so later ticks continue from it.
    fn load(&mut self, candles: &[Candle], closes: &[f64]) {
        self.reset();
        let mut streamed = None;
        for &close in closes {
            streamed = self.state.push(close);
        }
        self.points = candles
            .iter()
            .skip(self.template.lead())
            .map(|c| c.time)
            .zip(self.template.batch(closes))
            .collect();

        let batched = self.points.last().map(|&(_, v)| v);
        if streamed != batched {
            warn!(indicator = ?self.template, ?streamed, ?batched, "streaming state diverged from batch");
        }
    }

    fn feed(&mut self, time: i64, close: f64, revise: bool) -> Option<I::Output> {
        let value = if revise {
            self.state.revise(close)
        } else {
            self.state.push(close)
        }?;
        match self.points.last_mut() {
            Some(last) if last.0 == time => last.1 = value,
            _ => self.points.push((time, value)),
        }
        Some(value)
    }

    fn last(&self) -> Option<(i64, I::Output)> {
        self.points.last().copied()
    }
}

fn line_point(time: i64, value: f64) -> Option<ChartPoint> {
    value
        .is_finite()
        .then_some(ChartPoint::Line(IndicatorPoint { time, value }))
}

fn scalar_points<I: StreamingIndicator<Output = f64>>(track: &Track<I>) -> Vec<ChartPoint> {
    track.points.iter().filter_map(|&(t, v)| line_point(t, v)).collect()
}

fn macd_points(track: &Track<Macd>, pick: fn(&MacdValue) -> Option<f64>) -> Vec<ChartPoint> {
    track
        .points
        .iter()
        .filter_map(|(t, m)| pick(m).and_then(|v| line_point(*t, v)))
        .collect()
}

fn macd_line(m: &MacdValue) -> Option<f64> {
    Some(m.macd)
}

fn macd_signal(m: &MacdValue) -> Option<f64> {
    m.signal
}

fn macd_histogram(m: &MacdValue) -> Option<f64> {
    m.histogram
}

// ---------------------------------------------------------------------------
// IndicatorEngine
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct IndicatorEngine {
    settings: IndicatorSettings,
    rsi: Option<Track<Rsi>>,
    ema: Option<Track<Ema>>,
    sma: Option<Track<Sma>>,
    macd: Option<Track<Macd>>,
    bars: usize,
    active: bool,
}

impl IndicatorEngine {
    pub fn new(settings: IndicatorSettings) -> Self {
        Self {
            settings,
            rsi: settings.rsi.map(|p| Track::new(Rsi::new(p))),
            ema: settings.ema.map(|p| Track::new(Ema::new(p))),
            sma: settings.sma.map(|p| Track::new(Sma::new(p))),
            macd: settings
                .macd
                .map(|m| Track::new(Macd::new(m.fast, m.slow, m.signal))),
            bars: 0,
            active: false,
        }
    }

    pub fn settings(&self) -> &IndicatorSettings {
        &self.settings
    }

    /// Whether the minimum history has been reached.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Series ids this engine draws, in emission order.
    pub fn enabled_series(&self) -> Vec<SeriesId> {
        let mut ids = Vec::new();
        if self.rsi.is_some() {
            ids.push(SeriesId::Rsi);
        }
        if self.ema.is_some() {
            ids.push(SeriesId::Ema);
        }
        if self.sma.is_some() {
            ids.push(SeriesId::Sma);
        }
        if self.macd.is_some() {
            ids.extend([SeriesId::MacdLine, SeriesId::MacdSignal, SeriesId::MacdHistogram]);
        }
        ids
    }

    /// Drop all derived state (pair or interval changed).
    pub fn reset(&mut self) {
        if let Some(t) = self.rsi.as_mut() {
            t.reset();
        }
        if let Some(t) = self.ema.as_mut() {
            t.reset();
        }
        if let Some(t) = self.sma.as_mut() {
            t.reset();
        }
        if let Some(t) = self.macd.as_mut() {
            t.reset();
        }
        self.bars = 0;
        self.active = false;
    }

    /// Recompute everything from a freshly loaded candle series and send each
    /// enabled series in full (empty while below the minimum history).
    pub fn load(&mut self, candles: &[Candle], sink: &mut impl RenderSink) {
        self.reset();
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        if let Some(t) = self.rsi.as_mut() {
            t.load(candles, &closes);
        }
        if let Some(t) = self.ema.as_mut() {
            t.load(candles, &closes);
        }
        if let Some(t) = self.sma.as_mut() {
            t.load(candles, &closes);
        }
        if let Some(t) = self.macd.as_mut() {
            t.load(candles, &closes);
        }
        self.bars = candles.len();
        self.active = !candles.is_empty() && self.bars >= self.settings.min_history();
        debug!(bars = self.bars, active = self.active, "indicators loaded");
        self.emit_all(sink);
    }

    /// Follow one accepted change to the candle tail. Returns how many points
    /// were sent to the sink.
    pub fn apply(&mut self, candle: &Candle, outcome: ApplyOutcome, sink: &mut impl RenderSink) -> usize {
        let revise = match outcome {
            ApplyOutcome::Rejected => return 0,
            ApplyOutcome::Appended => false,
            ApplyOutcome::Replaced => self.bars > 0,
        };
        if !revise {
            self.bars += 1;
        }
        self.feed(candle, revise);

        if !self.active {
            if self.bars < self.settings.min_history() {
                return 0;
            }
            self.active = true;
            debug!(bars = self.bars, "indicator warm-up complete");
            return self.emit_all(sink);
        }

        self.emit_tail(candle.time, sink)
    }

    /// Send every enabled series in full.
    pub fn emit_all(&self, sink: &mut impl RenderSink) -> usize {
        let mut sent = 0;
        for id in self.enabled_series() {
            let points = if self.active { self.points(id) } else { Vec::new() };
            sent += points.len();
            sink.set_series(id, points);
        }
        sent
    }

    /// Current points of one series (empty when the series is disabled).
    pub fn points(&self, id: SeriesId) -> Vec<ChartPoint> {
        match id {
            SeriesId::Rsi => self.rsi.as_ref().map(scalar_points),
            SeriesId::Ema => self.ema.as_ref().map(scalar_points),
            SeriesId::Sma => self.sma.as_ref().map(scalar_points),
            SeriesId::MacdLine => self.macd.as_ref().map(|t| macd_points(t, macd_line)),
            SeriesId::MacdSignal => self.macd.as_ref().map(|t| macd_points(t, macd_signal)),
            SeriesId::MacdHistogram => self.macd.as_ref().map(|t| macd_points(t, macd_histogram)),
            SeriesId::Candles | SeriesId::Volume => None,
        }
        .unwrap_or_default()
    }

    /// Latest MACD record, if any.
    pub fn last_macd(&self) -> Option<(i64, MacdValue)> {
        self.macd.as_ref().and_then(Track::last)
    }

    fn feed(&mut self, candle: &Candle, revise: bool) {
        let (time, close) = (candle.time, candle.close);
        if let Some(t) = self.rsi.as_mut() {
            t.feed(time, close, revise);
        }
        if let Some(t) = self.ema.as_mut() {
            t.feed(time, close, revise);
        }
        if let Some(t) = self.sma.as_mut() {
            t.feed(time, close, revise);
        }
        if let Some(t) = self.macd.as_mut() {
            t.feed(time, close, revise);
        }
    }

    fn emit_tail(&self, time: i64, sink: &mut impl RenderSink) -> usize {
        let mut tail: Vec<(SeriesId, Option<ChartPoint>)> = Vec::new();

        let scalar_tail = |track: Option<(i64, f64)>| {
            track
                .filter(|(t, _)| *t == time)
                .and_then(|(t, v)| line_point(t, v))
        };
        if let Some(track) = &self.rsi {
            tail.push((SeriesId::Rsi, scalar_tail(track.last())));
        }
        if let Some(track) = &self.ema {
            tail.push((SeriesId::Ema, scalar_tail(track.last())));
        }
        if let Some(track) = &self.sma {
            tail.push((SeriesId::Sma, scalar_tail(track.last())));
        }
        if let Some((t, m)) = self.last_macd().filter(|(t, _)| *t == time) {
            tail.push((SeriesId::MacdLine, line_point(t, m.macd)));
            tail.push((SeriesId::MacdSignal, m.signal.and_then(|v| line_point(t, v))));
            tail.push((SeriesId::MacdHistogram, m.histogram.and_then(|v| line_point(t, v))));
        }

        let mut sent = 0;
        for (id, point) in tail {
            if let Some(point) = point {
                sink.update_point(id, point);
                sent += 1;
            }
        }
        sent
    }
}
