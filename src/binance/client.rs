// =============================================================================
// Binance REST API Client — public market data
// =============================================================================
//
// Only the unauthenticated kline endpoint is needed to seed a chart, so no API
// key or request signing is involved.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::market_data::HistoricalSource;
use crate::types::{Candle, CandleKey};

/// Request timeout for REST calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Binance REST API client.
#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
}

impl BinanceClient {
    /// Create a client against `base_url` (e.g. `https://api.binance.com`).
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build reqwest client")?;

        debug!(base_url = %base_url, "BinanceClient initialised");

        Ok(Self { base_url, client })
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /api/v3/klines (public — no signature required).
    ///
    /// Returns bars oldest first with `time` in UNIX seconds. Rows that are
    /// malformed or carry non-finite values are skipped with a warning.
    ///
    /// Array indices:
    ///   [0] openTime (ms), [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, ...
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/klines returned {}: {}", status, body);
        }

        let candles = parse_klines(&body)?;
        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }
}

impl HistoricalSource for BinanceClient {
    fn fetch(&self, key: &CandleKey, limit: u32) -> impl Future<Output = Result<Vec<Candle>>> + Send {
        let client = self.clone();
        let key = key.clone();
        async move { client.get_klines(&key.symbol, &key.interval, limit).await }
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// -------------------------------------------------------------------------
// Parsing helpers
// -------------------------------------------------------------------------

/// Parse Binance's array-of-arrays kline payload.
pub fn parse_klines(body: &serde_json::Value) -> Result<Vec<Candle>> {
    let raw = body.as_array().context("klines response is not an array")?;

    let mut candles = Vec::with_capacity(raw.len());
    for entry in raw {
        match parse_kline_row(entry) {
            Ok(candle) => candles.push(candle),
            Err(e) => warn!(error = %e, "skipping malformed kline entry"),
        }
    }
    Ok(candles)
}

fn parse_kline_row(entry: &serde_json::Value) -> Result<Candle> {
    let arr = entry.as_array().context("kline entry is not an array")?;
    if arr.len() < 6 {
        anyhow::bail!("kline entry has {} elements", arr.len());
    }

    let open_time_ms = arr[0].as_i64().context("kline openTime is not an integer")?;
    let candle = Candle::new(
        open_time_ms.div_euclid(1000),
        parse_str_f64(&arr[1])?,
        parse_str_f64(&arr[2])?,
        parse_str_f64(&arr[3])?,
        parse_str_f64(&arr[4])?,
        parse_str_f64(&arr[5])?,
    );
    if !candle.is_finite() {
        anyhow::bail!("kline at {open_time_ms} has non-finite values");
    }
    Ok(candle)
}

/// Parse a JSON value that may be either a string or a number into `f64`.
pub fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}
