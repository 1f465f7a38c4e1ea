// =============================================================================
// Runtime Configuration — chart feed settings with atomic save
// =============================================================================
//
// Every field carries `#[serde(default)]` so an older or partial config file
// always loads. Persistence uses a tmp + rename write so a crash mid-save never
// leaves a truncated file behind.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::indicators::engine::{IndicatorSettings, MacdParams};
use crate::indicators::macd::{DEFAULT_FAST, DEFAULT_SIGNAL, DEFAULT_SLOW};
use crate::market_data::price_history::DEFAULT_RETENTION_SECS;
use crate::types::CandleKey;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_interval() -> String {
    "1h".to_string()
}

fn default_history_limit() -> u32 {
    500
}

fn default_price_retention_secs() -> i64 {
    DEFAULT_RETENTION_SECS
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_rest_base_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_ws_base_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_period() -> usize {
    14
}

fn default_macd_fast() -> usize {
    DEFAULT_FAST
}

fn default_macd_slow() -> usize {
    DEFAULT_SLOW
}

fn default_macd_signal() -> usize {
    DEFAULT_SIGNAL
}

// =============================================================================
// Indicator settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_period")]
    pub period: usize,
}

impl Default for RsiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            period: default_period(),
        }
    }
}

/// EMA and SMA are toggled together, as one overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovingAverageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_period")]
    pub ema_period: usize,
    #[serde(default = "default_period")]
    pub sma_period: usize,
}

impl Default for MovingAverageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ema_period: default_period(),
            sma_period: default_period(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacdConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_macd_fast")]
    pub fast: usize,
    #[serde(default = "default_macd_slow")]
    pub slow: usize,
    #[serde(default = "default_macd_signal")]
    pub signal: usize,
}

impl Default for MacdConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fast: DEFAULT_FAST,
            slow: DEFAULT_SLOW,
            signal: DEFAULT_SIGNAL,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorConfig {
    #[serde(default)]
    pub rsi: RsiConfig,
    #[serde(default)]
    pub moving_averages: MovingAverageConfig,
    #[serde(default)]
    pub macd: MacdConfig,
}

impl IndicatorConfig {
    /// Engine settings for the enabled indicators. Zero periods disable an
    /// indicator rather than producing an always-empty series.
    pub fn settings(&self) -> IndicatorSettings {
        let nonzero = |p: usize| (p > 0).then_some(p);
        let ma = &self.moving_averages;
        let macd = &self.macd;
        IndicatorSettings {
            rsi: self.rsi.enabled.then_some(self.rsi.period).and_then(nonzero),
            ema: ma.enabled.then_some(ma.ema_period).and_then(nonzero),
            sma: ma.enabled.then_some(ma.sma_period).and_then(nonzero),
            macd: (macd.enabled && macd.fast > 0 && macd.slow > 0 && macd.signal > 0).then_some(
                MacdParams {
                    fast: macd.fast,
                    slow: macd.slow,
                    signal: macd.signal,
                },
            ),
        }
    }
}

// =============================================================================
// ChartConfig
// =============================================================================

/// Top-level configuration for the chart feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartConfig {
    // --- Watched pair -------------------------------------------------------

    /// Trading pair shown on start-up, e.g. "BTCUSDT".
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Candle interval shown on start-up, e.g. "1h".
    #[serde(default = "default_interval")]
    pub interval: String,

    // --- Feed ---------------------------------------------------------------

    /// Number of historical bars fetched on every (re)subscription.
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,

    /// Price history retention window, in seconds behind the newest sample.
    #[serde(default = "default_price_retention_secs")]
    pub price_retention_secs: i64,

    /// Delay before re-subscribing after the live stream drops. 0 disables.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,

    // --- API ----------------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // --- Indicators ---------------------------------------------------------

    #[serde(default)]
    pub indicators: IndicatorConfig,
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            interval: default_interval(),
            history_limit: default_history_limit(),
            price_retention_secs: default_price_retention_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            rest_base_url: default_rest_base_url(),
            ws_base_url: default_ws_base_url(),
            bind_addr: default_bind_addr(),
            indicators: IndicatorConfig::default(),
        }
    }
}

impl ChartConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read chart config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse chart config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            interval = %config.interval,
            "chart config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise chart config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "chart config saved (atomic)");
        Ok(())
    }

    /// Apply `CHART_SYMBOL`, `CHART_INTERVAL` and `CHART_BIND_ADDR` if set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(symbol) = std::env::var("CHART_SYMBOL") {
            self.symbol = symbol.trim().to_uppercase();
        }
        if let Ok(interval) = std::env::var("CHART_INTERVAL") {
            self.interval = interval.trim().to_string();
        }
        if let Ok(addr) = std::env::var("CHART_BIND_ADDR") {
            self.bind_addr = addr;
        }
    }

    /// The pair to watch on start-up.
    pub fn initial_key(&self) -> Result<CandleKey> {
        CandleKey::new(&self.symbol, &self.interval)
            .with_context(|| format!("invalid start-up pair {}@{}", self.symbol, self.interval))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = ChartConfig::default();
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert_eq!(cfg.interval, "1h");
        assert_eq!(cfg.history_limit, 500);
        assert_eq!(cfg.price_retention_secs, 120);
        assert!(cfg.indicators.moving_averages.enabled);
        assert!(!cfg.indicators.rsi.enabled);
        assert!(!cfg.indicators.macd.enabled);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: ChartConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert_eq!(cfg.indicators.macd.slow, 26);
        assert_eq!(cfg.reconnect_delay_secs, 5);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbol": "ETHUSDT", "indicators": { "rsi": { "enabled": true } } }"#;
        let cfg: ChartConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert!(cfg.indicators.rsi.enabled);
        assert_eq!(cfg.indicators.rsi.period, 14);
        assert!(cfg.indicators.moving_averages.enabled);
    }

    #[test]
    fn settings_follow_enabled_flags() {
        let mut cfg = IndicatorConfig::default();
        let s = cfg.settings();
        assert_eq!(s.rsi, None);
        assert_eq!(s.ema, Some(14));
        assert_eq!(s.sma, Some(14));
        assert_eq!(s.macd, None);

        cfg.macd.enabled = true;
        cfg.rsi.enabled = true;
        cfg.rsi.period = 0;
        let s = cfg.settings();
        assert_eq!(s.rsi, None);
        assert_eq!(s.macd, Some(MacdParams { fast: 12, slow: 26, signal: 9 }));
        assert_eq!(s.min_history(), 26);
    }

    #[test]
    fn initial_key_validates_interval() {
        let mut cfg = ChartConfig::default();
        assert_eq!(cfg.initial_key().unwrap().to_string(), "BTCUSDT@1h");
        cfg.interval = "2h".into();
        assert!(cfg.initial_key().is_err());
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("chart-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("chart_config.json");

        let mut cfg = ChartConfig::default();
        cfg.symbol = "BNBUSDT".into();
        cfg.save(&path).unwrap();
        let loaded = ChartConfig::load(&path).unwrap();
        assert_eq!(loaded.symbol, "BNBUSDT");
        assert!(!path.with_extension("json.tmp").exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
