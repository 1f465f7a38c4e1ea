// =============================================================================
// Simple Moving Average (SMA)
// =============================================================================
//
//   SMA_i = (close_{i-P+1} + ... + close_i) / P
//
// Output element k aligns to close index k + P - 1.
// =============================================================================

use std::collections::VecDeque;

use super::StreamingIndicator;

/// Mean of one window, summed front to back.
fn window_mean<'a>(window: impl Iterator<Item = &'a f64>, period: usize) -> f64 {
    window.sum::<f64>() / period as f64
}

/// Compute the SMA series for `closes`.
///
/// Returns an empty `Vec` when `period == 0` or the input is shorter than
/// `period`; otherwise `closes.len() - period + 1` values.
pub fn calculate_sma(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }
    closes
        .windows(period)
        .map(|w| window_mean(w.iter(), period))
        .collect()
}

/// Streaming SMA over a fixed window of the most recent closes.
///
/// The window is re-summed on each update rather than kept as a running sum,
/// so the value matches [`calculate_sma`] to the bit.
#[derive(Debug, Clone)]
pub struct Sma {
    period: usize,
    window: VecDeque<f64>,
}

impl Sma {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            window: VecDeque::with_capacity(period + 1),
        }
    }
}

impl StreamingIndicator for Sma {
    type Output = f64;

    fn update(&mut self, close: f64) -> Option<f64> {
        if self.period == 0 {
            return None;
        }
        self.window.push_back(close);
        if self.window.len() > self.period {
            self.window.pop_front();
        }
        (self.window.len() == self.period).then(|| window_mean(self.window.iter(), self.period))
    }

    fn lead(&self) -> usize {
        self.period.saturating_sub(1)
    }

    fn batch(&self, closes: &[f64]) -> Vec<f64> {
        calculate_sma(closes, self.period)
    }
}
