// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// EMA gives more weight to recent prices, making it more responsive to new
// information than the Simple Moving Average (SMA).
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The very first EMA value is seeded with the SMA of the first `period` closes.
// =============================================================================

use super::StreamingIndicator;

fn multiplier(period: usize) -> f64 {
    2.0 / (period + 1) as f64
}

fn seed(closes: &[f64], period: usize) -> f64 {
    closes.iter().sum::<f64>() / period as f64
}

fn step(close: f64, prev: f64, multiplier: f64) -> f64 {
    close * multiplier + prev * (1.0 - multiplier)
}

/// Compute the EMA series for the given `closes` slice and look-back `period`.
///
/// Returns an empty `Vec` when the input is too short or the period is zero.
/// Each output element corresponds to a close starting at index `period - 1`.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let multiplier = multiplier(period);
    let mut prev = seed(&closes[..period], period);

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    result.push(prev);
    for &close in &closes[period..] {
        prev = step(close, prev, multiplier);
        result.push(prev);
    }
    result
}

/// Streaming EMA with SMA seeding, identical to [`calculate_ema`].
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    multiplier: f64,
    warmup: Vec<f64>,
    value: Option<f64>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            multiplier: multiplier(period),
            warmup: Vec::with_capacity(period),
            value: None,
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }
}

impl StreamingIndicator for Ema {
    type Output = f64;

    fn update(&mut self, close: f64) -> Option<f64> {
        if self.period == 0 {
            return None;
        }
        self.value = match self.value {
            Some(prev) => Some(step(close, prev, self.multiplier)),
            None => {
                self.warmup.push(close);
                if self.warmup.len() < self.period {
                    return None;
                }
                let sma = seed(&self.warmup, self.period);
                self.warmup = Vec::new();
                Some(sma)
            }
        };
        self.value
    }

    fn lead(&self) -> usize {
        self.period.saturating_sub(1)
    }

    fn batch(&self, closes: &[f64]) -> Vec<f64> {
        calculate_ema(closes, self.period)
    }
}
