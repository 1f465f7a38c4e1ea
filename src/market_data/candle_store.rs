use tracing::debug;

use crate::types::Candle;

// ---------------------------------------------------------------------------
// Outcome of a live update
// ---------------------------------------------------------------------------

/// What [`CandleStore::apply_live_update`] did with an incoming candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new bar was appended; the previous tail (if any) has closed.
    Appended,
    /// The open bar was overwritten in place.
    Replaced,
    /// The candle was older than the tail and was dropped.
    Rejected,
}

impl ApplyOutcome {
    pub fn is_accepted(self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

// ---------------------------------------------------------------------------
// CandleStore
// ---------------------------------------------------------------------------

/// Ordered candle series for a single (symbol, interval) pair.
///
/// `time` is strictly increasing across the series; only the last element
/// (the open bar) is ever revised in place.
#[derive(Debug, Default)]
pub struct CandleStore {
    candles: Vec<Candle>,
}

impl CandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entire series with a historical snapshot.
    ///
    /// The snapshot is expected sorted ascending. Rows that would break the
    /// ordering are dropped so the invariant holds regardless of input.
    pub fn load_historical(&mut self, candles: Vec<Candle>) {
        self.candles.clear();
        self.candles.reserve(candles.len());
        for candle in candles {
            match self.candles.last() {
                Some(last) if candle.time <= last.time => {
                    debug!(time = candle.time, last = last.time, "dropping unordered historical bar");
                }
                _ => self.candles.push(candle),
            }
        }
    }

    /// Merge a live candle into the series.
    ///
    /// * empty series or newer bar  => append
    /// * same open time as the tail => overwrite the tail (full state, not delta)
    /// * older than the tail        => reject, no mutation
    pub fn apply_live_update(&mut self, candle: Candle) -> ApplyOutcome {
        let Some(last) = self.candles.last_mut() else {
            self.candles.push(candle);
            return ApplyOutcome::Appended;
        };

        if candle.time == last.time {
            *last = candle;
            ApplyOutcome::Replaced
        } else if candle.time > last.time {
            self.candles.push(candle);
            ApplyOutcome::Appended
        } else {
            debug!(time = candle.time, last = last.time, "stale live update dropped");
            ApplyOutcome::Rejected
        }
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    /// Discard everything (pair or interval changed).
    pub fn clear(&mut self) {
        self.candles.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
