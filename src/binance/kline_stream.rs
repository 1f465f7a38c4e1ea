// =============================================================================
// Kline WebSocket stream
// =============================================================================
//
// One connection per subscription. Each text frame is parsed into a
// `LiveTick` and forwarded on the subscription's channel; malformed frames
// are logged and skipped. A read error or close ends the task after a single
// `StreamEvent::Closed`. Reconnecting is the caller's decision.
// =============================================================================

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::client::parse_str_f64;
use crate::market_data::{KlineSubscription, LiveSource, LiveTick, StreamEvent};
use crate::types::{Candle, CandleKey};

/// Events buffered per subscription before the reader waits on the session.
const CHANNEL_CAPACITY: usize = 1024;

/// Opens Binance `<symbol>@kline_<interval>` streams.
#[derive(Debug, Clone)]
pub struct BinanceKlineSource {
    ws_base_url: String,
}

impl BinanceKlineSource {
    /// `ws_base_url` e.g. `wss://stream.binance.com:9443`.
    pub fn new(ws_base_url: impl Into<String>) -> Self {
        Self {
            ws_base_url: ws_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn stream_url(&self, key: &CandleKey) -> String {
        format!(
            "{}/ws/{}@kline_{}",
            self.ws_base_url,
            key.symbol.to_lowercase(),
            key.interval
        )
    }
}

impl LiveSource for BinanceKlineSource {
    fn subscribe(&self, key: &CandleKey) -> KlineSubscription {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let url = self.stream_url(key);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            let reason = match run_kline_stream(&url, &task_key, &tx).await {
                Ok(()) => None,
                Err(e) => {
                    error!(key = %task_key, error = %e, "kline stream failed");
                    Some(format!("{e:#}"))
                }
            };
            // The session may already have dropped the subscription.
            if tx.send(StreamEvent::Closed { reason }).await.is_err() {
                debug!(key = %task_key, "subscription gone before close was delivered");
            }
        });
        KlineSubscription::new(key.clone(), rx, Some(task))
    }
}

/// Read frames until the stream ends. `Ok(())` means a clean close.
async fn run_kline_stream(url: &str, key: &CandleKey, tx: &mpsc::Sender<StreamEvent>) -> Result<()> {
    info!(url = %url, key = %key, "connecting to kline WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to kline WebSocket")?;

    info!(key = %key, "kline WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match parse_kline_message(&text) {
                Ok(tick) => {
                    debug!(key = %key, time = tick.candle.time, close = tick.candle.close, "kline update");
                    if tx.send(StreamEvent::Tick(tick)).await.is_err() {
                        debug!(key = %key, "subscription dropped, stopping reader");
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to parse kline message");
                }
            },
            Some(Ok(Message::Close(frame))) => {
                warn!(key = %key, frame = ?frame, "kline WebSocket closed by server");
                return Ok(());
            }
            // Ping / Pong / Binary: tungstenite answers pings itself.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                return Err(e).context("kline WebSocket read error");
            }
            None => {
                warn!(key = %key, "kline WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a kline message, either bare or wrapped in a combined-stream
/// envelope.
///
/// Expected shape:
/// ```json
/// { "e": "kline", "E": 1700000001234, "s": "BTCUSDT", "k": { "t": ..., "o": "...", ... } }
/// ```
pub fn parse_kline_message(text: &str) -> Result<LiveTick> {
    let root: serde_json::Value = serde_json::from_str(text).context("failed to parse kline JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let k = data.get("k").context("missing field k")?;

    let open_time_ms = k["t"].as_i64().context("missing field k.t")?;
    let candle = Candle::new(
        open_time_ms.div_euclid(1000),
        parse_str_f64(&k["o"]).context("field k.o")?,
        parse_str_f64(&k["h"]).context("field k.h")?,
        parse_str_f64(&k["l"]).context("field k.l")?,
        parse_str_f64(&k["c"]).context("field k.c")?,
        parse_str_f64(&k["v"]).context("field k.v")?,
    );
    if !candle.is_finite() {
        anyhow::bail!("kline at {open_time_ms} has non-finite values");
    }

    let event_time = data["E"]
        .as_i64()
        .map_or(candle.time, |ms| ms.div_euclid(1000));

    Ok(LiveTick { candle, event_time })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE: &str = r#"{
        "e": "kline",
        "E": 1700000031500,
        "s": "BTCUSDT",
        "k": {
            "t": 1700000000000,
            "T": 1700000059999,
            "i": "1m",
            "o": "37000.00",
            "h": "37050.00",
            "l": "36990.00",
            "c": "37020.00",
            "v": "123.456",
            "x": false
        }
    }"#;

    #[test]
    fn parse_single_stream_message() {
        let tick = parse_kline_message(SINGLE).expect("should parse");
        assert_eq!(tick.candle.time, 1_700_000_000);
        assert_eq!(tick.event_time, 1_700_000_031);
        assert!((tick.candle.close - 37020.0).abs() < f64::EPSILON);
        assert!((tick.candle.volume - 123.456).abs() < 1e-9);
    }

    #[test]
    fn parse_combined_envelope() {
        let json = format!(r#"{{ "stream": "btcusdt@kline_1m", "data": {SINGLE} }}"#);
        let tick = parse_kline_message(&json).expect("should parse");
        assert_eq!(tick.candle.time, 1_700_000_000);
    }

    #[test]
    fn missing_event_time_falls_back_to_bar_time() {
        let json = r#"{ "k": { "t": 60000, "o": "1", "h": "2", "l": "0.5", "c": "1.5", "v": "3" } }"#;
        let tick = parse_kline_message(json).unwrap();
        assert_eq!(tick.event_time, 60);
    }

    #[test]
    fn malformed_messages_are_errors() {
        assert!(parse_kline_message("not json").is_err());
        assert!(parse_kline_message(r#"{ "result": null, "id": 1 }"#).is_err());
        let bad_price = r#"{ "k": { "t": 0, "o": "x", "h": "2", "l": "0.5", "c": "1.5", "v": "3" } }"#;
        assert!(parse_kline_message(bad_price).is_err());
        let nan = r#"{ "k": { "t": 0, "o": "1", "h": "2", "l": "0.5", "c": "NaN", "v": "3" } }"#;
        assert!(parse_kline_message(nan).is_err());
    }

    #[test]
    fn stream_url_lowercases_symbol() {
        let source = BinanceKlineSource::new("wss://stream.binance.com:9443/");
        let key = CandleKey::new("ETHUSDT", "15m").unwrap();
        assert_eq!(
            source.stream_url(&key),
            "wss://stream.binance.com:9443/ws/ethusdt@kline_15m"
        );
    }
}
