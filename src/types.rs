// =============================================================================
// Shared types used across the chart pipeline
// =============================================================================

use serde::{Deserialize, Serialize};

/// Intervals accepted for both the historical fetch and the kline stream.
pub const SUPPORTED_INTERVALS: &[&str] = &["1m", "5m", "15m", "1h", "4h", "1d", "1w"];

/// A single OHLCV bar. `time` is the bar's open time in UNIX seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Every price and volume field is a finite number.
    pub fn is_finite(&self) -> bool {
        [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite())
    }

    /// Bar closed below its open; the chart colours such volume red.
    pub fn is_down(&self) -> bool {
        self.open > self.close
    }
}

/// Identifies the (symbol, interval) pair a pipeline is watching.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: String,
}

impl CandleKey {
    /// Normalise the symbol to upper case and validate the interval.
    pub fn new(symbol: &str, interval: &str) -> anyhow::Result<Self> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            anyhow::bail!("symbol must not be empty");
        }
        let interval = interval.trim();
        if !SUPPORTED_INTERVALS.contains(&interval) {
            anyhow::bail!("unsupported interval '{interval}'");
        }
        Ok(Self {
            symbol,
            interval: interval.to_string(),
        })
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// A timestamped last-trade price.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    pub time: i64,
    pub price: f64,
}

/// One value of a scalar indicator series, aligned to a candle's open time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorPoint {
    pub time: i64,
    pub value: f64,
}

/// One MACD record. `signal` and `histogram` are absent until the signal EMA
/// has warmed up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MacdValue {
    pub macd: f64,
    pub signal: Option<f64>,
    pub histogram: Option<f64>,
}

/// Named series the render sink draws.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesId {
    Candles,
    Volume,
    Rsi,
    Ema,
    Sma,
    MacdLine,
    MacdSignal,
    MacdHistogram,
}

impl std::fmt::Display for SeriesId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Candles => "candles",
            Self::Volume => "volume",
            Self::Rsi => "rsi",
            Self::Ema => "ema",
            Self::Sma => "sma",
            Self::MacdLine => "macd_line",
            Self::MacdSignal => "macd_signal",
            Self::MacdHistogram => "macd_histogram",
        };
        f.write_str(name)
    }
}

/// A single point handed to the render sink.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChartPoint {
    Candle(Candle),
    Volume { time: i64, value: f64, down: bool },
    Line(IndicatorPoint),
}

impl ChartPoint {
    pub fn time(&self) -> i64 {
        match self {
            Self::Candle(c) => c.time,
            Self::Volume { time, .. } => *time,
            Self::Line(p) => p.time,
        }
    }

    pub fn volume_of(candle: &Candle) -> Self {
        Self::Volume {
            time: candle.time,
            value: candle.volume,
            down: candle.is_down(),
        }
    }
}

/// A message for the render sink: bulk replace or tail append/replace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RenderEvent {
    SetSeries { series: SeriesId, points: Vec<ChartPoint> },
    UpdatePoint { series: SeriesId, point: ChartPoint },
}

/// Connection state of the live kline feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStatus {
    #[default]
    Connecting,
    Live,
    Disconnected,
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Live => write!(f, "Live"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_normalises_symbol() {
        let key = CandleKey::new(" btcusdt ", "1m").unwrap();
        assert_eq!(key.symbol, "BTCUSDT");
        assert_eq!(key.to_string(), "BTCUSDT@1m");
    }

    #[test]
    fn key_rejects_unknown_interval() {
        assert!(CandleKey::new("BTCUSDT", "7m").is_err());
        assert!(CandleKey::new("", "1m").is_err());
    }

    #[test]
    fn render_event_json_shape() {
        let ev = RenderEvent::UpdatePoint {
            series: SeriesId::MacdSignal,
            point: ChartPoint::Line(IndicatorPoint { time: 60, value: 1.5 }),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["op"], "update_point");
        assert_eq!(json["series"], "macd_signal");
        assert_eq!(json["point"]["kind"], "line");
        assert_eq!(json["point"]["time"], 60);
    }

    #[test]
    fn non_finite_candle_detected() {
        let ok = Candle::new(0, 1.0, 2.0, 0.5, 1.5, 10.0);
        assert!(ok.is_finite());
        let bad = Candle::new(0, 1.0, 2.0, 0.5, f64::NAN, 10.0);
        assert!(!bad.is_finite());
    }

    #[test]
    fn stream_starts_connecting() {
        assert_eq!(StreamStatus::default(), StreamStatus::Connecting);
        assert_eq!(serde_json::to_value(StreamStatus::default()).unwrap(), "Connecting");
    }
}
