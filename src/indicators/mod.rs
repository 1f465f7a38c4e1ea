// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Each indicator comes in two forms that produce bit-identical values:
//
//   * a pure batch function (`calculate_*`) over a full close-price slice, and
//   * a streaming state (`update(close)`) fed one close at a time.
//
// The streaming form is wrapped in `Revisable` so the open bar can be revised
// in place: the state from just before the tail is kept and replayed with the
// new close, which reproduces exactly what a batch run over the revised
// series would compute.

pub mod ema;
pub mod engine;
pub mod macd;
pub mod rsi;
pub mod sma;

pub use engine::{IndicatorEngine, IndicatorSettings};

/// An indicator that consumes one close at a time, with a batch form over a
/// whole close series that yields the same values.
pub trait StreamingIndicator: Clone + std::fmt::Debug {
    type Output: Copy + std::fmt::Debug + PartialEq;

    /// Feed the next close; `None` while still warming up.
    fn update(&mut self, close: f64) -> Option<Self::Output>;

    /// Index of the first close that produces an output.
    fn lead(&self) -> usize;

    /// Full series over `closes`; element `k` aligns to close `k + lead()`.
    fn batch(&self, closes: &[f64]) -> Vec<Self::Output>;
}

/// Streaming state that can replace its most recent input.
#[derive(Debug, Clone)]
pub struct Revisable<I> {
    current: I,
    before_tail: Option<I>,
}

impl<I: StreamingIndicator> Revisable<I> {
    pub fn new(indicator: I) -> Self {
        Self {
            current: indicator,
            before_tail: None,
        }
    }

    /// A new bar: the current state becomes the pre-tail checkpoint.
    pub fn push(&mut self, close: f64) -> Option<I::Output> {
        self.before_tail = Some(self.current.clone());
        self.current.update(close)
    }

    /// The open bar changed: rewind to the checkpoint and replay.
    ///
    /// Behaves like `push` when nothing has been pushed yet.
    pub fn revise(&mut self, close: f64) -> Option<I::Output> {
        match &self.before_tail {
            Some(checkpoint) => {
                self.current = checkpoint.clone();
                self.current.update(close)
            }
            None => self.push(close),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Running sum, enough to exercise push / revise bookkeeping.
    #[derive(Debug, Clone, Default)]
    struct Sum(f64);

    impl StreamingIndicator for Sum {
        type Output = f64;
        fn update(&mut self, close: f64) -> Option<f64> {
            self.0 += close;
            Some(self.0)
        }
        fn lead(&self) -> usize {
            0
        }
        fn batch(&self, closes: &[f64]) -> Vec<f64> {
            closes
                .iter()
                .scan(self.0, |acc, &c| {
                    *acc += c;
                    Some(*acc)
                })
                .collect()
        }
    }

    #[test]
    fn revise_replays_from_checkpoint() {
        let mut r = Revisable::new(Sum::default());
        assert_eq!(r.push(1.0), Some(1.0));
        assert_eq!(r.push(2.0), Some(3.0));
        assert_eq!(r.revise(5.0), Some(6.0));
        assert_eq!(r.revise(4.0), Some(5.0));
        assert_eq!(r.push(10.0), Some(15.0));
    }

    #[test]
    fn revise_without_history_pushes() {
        let mut r = Revisable::new(Sum::default());
        assert_eq!(r.revise(2.0), Some(2.0));
        assert_eq!(r.revise(3.0), Some(3.0));
    }
}
