// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
// RSI measures the speed and magnitude of recent price changes to evaluate
// whether an asset is overbought or oversold.
//
// Step 1 — Compute price changes (deltas) from consecutive closes.
// Step 2 — Seed average gain / average loss with the SMA of the first `period`
//          gains / losses.
// Step 3 — Apply Wilder's exponential smoothing:
//            avg_gain = (prev_avg_gain * (period - 1) + current_gain) / period
//            avg_loss = (prev_avg_loss * (period - 1) + current_loss) / period
// Step 4 — RS  = avg_gain / avg_loss
//          RSI = 100 - 100 / (1 + RS)
// =============================================================================

use super::StreamingIndicator;

/// Average gain / average loss after seeding or smoothing.
#[derive(Debug, Clone, Copy)]
struct Averages {
    gain: f64,
    loss: f64,
}

impl Averages {
    fn seed(deltas: &[f64], period: usize) -> Self {
        let (sum_gain, sum_loss) = deltas.iter().fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });
        let period_f = period as f64;
        Self {
            gain: sum_gain / period_f,
            loss: sum_loss / period_f,
        }
    }

    fn smooth(self, delta: f64, period: usize) -> Self {
        let period_f = period as f64;
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };
        Self {
            gain: (self.gain * (period_f - 1.0) + gain) / period_f,
            loss: (self.loss * (period_f - 1.0) + loss) / period_f,
        }
    }

    /// RSI in [0, 100]. Zero average loss never reaches the division:
    /// flat input (no gains either) reads 0, pure gains read 100.
    fn rsi(self) -> f64 {
        let rsi = if self.loss == 0.0 && self.gain == 0.0 {
            0.0
        } else if self.loss == 0.0 {
            100.0
        } else {
            let rs = self.gain / self.loss;
            100.0 - 100.0 / (1.0 + rs)
        };
        rsi.clamp(0.0, 100.0)
    }
}

/// Compute the full RSI series for the given `closes` and `period`.
///
/// The returned vector has one RSI value for each close starting at index
/// `period` (the first `period` deltas seed the averages).
///
/// # Edge cases
/// - `period == 0` => empty vec
/// - `closes.len() < period + 1` => empty vec
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let mut averages = Averages::seed(&deltas[..period], period);
    let mut result = Vec::with_capacity(deltas.len() - period + 1);
    result.push(averages.rsi());

    for &delta in &deltas[period..] {
        averages = averages.smooth(delta, period);
        result.push(averages.rsi());
    }

    result
}

/// Streaming RSI, identical to [`calculate_rsi`].
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    prev_close: Option<f64>,
    seed_deltas: Vec<f64>,
    averages: Option<Averages>,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            prev_close: None,
            seed_deltas: Vec::with_capacity(period),
            averages: None,
        }
    }
}

impl StreamingIndicator for Rsi {
    type Output = f64;

    fn update(&mut self, close: f64) -> Option<f64> {
        if self.period == 0 {
            return None;
        }
        let prev = self.prev_close.replace(close)?;
        let delta = close - prev;

        let averages = match self.averages {
            Some(averages) => averages.smooth(delta, self.period),
            None => {
                self.seed_deltas.push(delta);
                if self.seed_deltas.len() < self.period {
                    return None;
                }
                let seeded = Averages::seed(&self.seed_deltas, self.period);
                self.seed_deltas = Vec::new();
                seeded
            }
        };
        self.averages = Some(averages);
        Some(averages.rsi())
    }

    fn lead(&self) -> usize {
        self.period
    }

    fn batch(&self, closes: &[f64]) -> Vec<f64> {
        calculate_rsi(closes, self.period)
    }
}
