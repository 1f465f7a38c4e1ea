// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
//   line      = EMA(fast) - EMA(slow)           from close index max(fast, slow) - 1
//   signal    = EMA(signal) over `line`         from line index signal - 1
//   histogram = line - signal                   wherever signal exists
//
// Both EMAs are SMA-seeded (see `ema.rs`).
// =============================================================================

use super::ema::{calculate_ema, Ema};
use super::StreamingIndicator;
use crate::types::MacdValue;

pub const DEFAULT_FAST: usize = 12;
pub const DEFAULT_SLOW: usize = 26;
pub const DEFAULT_SIGNAL: usize = 9;

fn record(line: f64, signal: Option<f64>) -> MacdValue {
    MacdValue {
        macd: line,
        signal,
        histogram: signal.map(|s| line - s),
    }
}

/// Compute MACD over `closes`.
///
/// Element `k` aligns to close index `k + max(fast, slow) - 1`. `signal` and
/// `histogram` are `None` for the first `signal - 1` elements.
pub fn calculate_macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Vec<MacdValue> {
    if fast == 0 || slow == 0 || signal == 0 {
        return Vec::new();
    }
    let fast_ema = calculate_ema(closes, fast);
    let slow_ema = calculate_ema(closes, slow);
    let start = fast.max(slow) - 1;
    if closes.len() <= start {
        return Vec::new();
    }

    let line: Vec<f64> = (start..closes.len())
        .map(|i| fast_ema[i + 1 - fast] - slow_ema[i + 1 - slow])
        .collect();
    let signal_ema = calculate_ema(&line, signal);

    line.iter()
        .enumerate()
        .map(|(k, &l)| {
            let s = (k + 1).checked_sub(signal).and_then(|j| signal_ema.get(j).copied());
            record(l, s)
        })
        .collect()
}

/// Streaming MACD, identical to [`calculate_macd`].
#[derive(Debug, Clone)]
pub struct Macd {
    fast: Ema,
    slow: Ema,
    signal: Ema,
}

impl Macd {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        Self {
            fast: Ema::new(fast),
            slow: Ema::new(slow),
            signal: Ema::new(signal),
        }
    }

    /// Number of closes before the first MACD line value.
    pub fn warmup(&self) -> usize {
        self.fast.period().max(self.slow.period())
    }
}

impl Default for Macd {
    fn default() -> Self {
        Self::new(DEFAULT_FAST, DEFAULT_SLOW, DEFAULT_SIGNAL)
    }
}

impl StreamingIndicator for Macd {
    type Output = MacdValue;

    fn update(&mut self, close: f64) -> Option<MacdValue> {
        if self.signal.period() == 0 {
            return None;
        }
        let fast = self.fast.update(close);
        let slow = self.slow.update(close);
        let line = fast? - slow?;
        let signal = self.signal.update(line);
        Some(record(line, signal))
    }

    fn lead(&self) -> usize {
        self.warmup().saturating_sub(1)
    }

    fn batch(&self, closes: &[f64]) -> Vec<MacdValue> {
        calculate_macd(closes, self.fast.period(), self.slow.period(), self.signal.period())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wave(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| 100.0 + (i as f64 * 0.3).sin() * 5.0 + i as f64 * 0.2)
            .collect()
    }

    #[test]
    fn macd_alignment_and_warmup() {
        let closes = wave(60);
        let macd = calculate_macd(&closes, 12, 26, 9);
        assert_eq!(macd.len(), 60 - 25);
        // Signal first defined at close index 26 - 1 + 9 - 1 = 33, i.e. k = 8.
        assert!(macd[..8].iter().all(|m| m.signal.is_none() && m.histogram.is_none()));
        assert!(macd[8..].iter().all(|m| m.signal.is_some()));
    }

    #[test]
    fn macd_line_is_fast_minus_slow() {
        let closes = wave(50);
        let macd = calculate_macd(&closes, 12, 26, 9);
        let fast = calculate_ema(&closes, 12);
        let slow = calculate_ema(&closes, 26);
        // Close index 30 -> macd[5], fast[19], slow[5].
        assert_eq!(macd[5].macd.to_bits(), (fast[19] - slow[5]).to_bits());
    }

    #[test]
    fn histogram_is_line_minus_signal() {
        let macd = calculate_macd(&wave(120), 12, 26, 9);
        for m in &macd {
            if let (Some(s), Some(h)) = (m.signal, m.histogram) {
                assert_eq!(h.to_bits(), (m.macd - s).to_bits());
            }
        }
    }

    #[test]
    fn macd_short_input() {
        assert!(calculate_macd(&wave(25), 12, 26, 9).is_empty());
        assert_eq!(calculate_macd(&wave(26), 12, 26, 9).len(), 1);
        assert!(calculate_macd(&[], 12, 26, 9).is_empty());
        assert!(calculate_macd(&wave(40), 12, 26, 0).is_empty());
    }

    #[test]
    fn streaming_matches_batch_bitwise() {
        let closes = wave(100);
        let batch = calculate_macd(&closes, 12, 26, 9);
        let mut macd = Macd::default();
        let streamed: Vec<MacdValue> = closes.iter().filter_map(|&c| macd.update(c)).collect();
        assert_eq!(batch.len(), streamed.len());
        for (a, b) in batch.iter().zip(&streamed) {
            assert_eq!(a.macd.to_bits(), b.macd.to_bits());
            assert_eq!(a.signal.map(f64::to_bits), b.signal.map(f64::to_bits));
            assert_eq!(a.histogram.map(f64::to_bits), b.histogram.map(f64::to_bits));
        }
    }
}
