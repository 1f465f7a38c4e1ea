// =============================================================================
// Price History Tracker — rolling window of last-trade prices
// =============================================================================
//
// Records every live tick (not only bar closes) so "price N seconds ago"
// queries have sub-bar resolution. Samples older than `retention_secs` behind
// the newest sample are evicted on every record.
// =============================================================================

use std::collections::VecDeque;

use crate::types::PriceSample;

/// Default retention window in seconds.
pub const DEFAULT_RETENTION_SECS: i64 = 120;

#[derive(Debug)]
pub struct PriceHistory {
    samples: VecDeque<PriceSample>,
    retention_secs: i64,
}

impl Default for PriceHistory {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_SECS)
    }
}

impl PriceHistory {
    pub fn new(retention_secs: i64) -> Self {
        Self {
            samples: VecDeque::new(),
            retention_secs: retention_secs.max(0),
        }
    }

    /// Append a sample, then evict everything older than
    /// `newest_time - retention_secs`.
    ///
    /// A sample stamped earlier than the current newest is inserted in time
    /// order so lookups stay a simple ordered scan.
    pub fn record(&mut self, time: i64, price: f64) {
        let sample = PriceSample { time, price };
        match self.samples.back() {
            Some(last) if time < last.time => {
                let idx = self.samples.partition_point(|s| s.time <= time);
                self.samples.insert(idx, sample);
            }
            _ => self.samples.push_back(sample),
        }

        let Some(newest) = self.samples.back().map(|s| s.time) else {
            return;
        };
        let cutoff = newest - self.retention_secs;
        while self.samples.front().is_some_and(|s| s.time < cutoff) {
            self.samples.pop_front();
        }
    }

    /// The retained sample with the greatest `time <= now - lag`.
    ///
    /// Falls back to the oldest retained sample when none is old enough, and
    /// returns `None` only when the buffer is empty.
    pub fn price_before(&self, now: i64, lag: i64) -> Option<PriceSample> {
        let target = now - lag;
        let idx = self.samples.partition_point(|s| s.time <= target);
        if idx > 0 {
            self.samples.get(idx - 1).copied()
        } else {
            self.samples.front().copied()
        }
    }

    /// Newest retained sample.
    pub fn latest(&self) -> Option<PriceSample> {
        self.samples.back().copied()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
impl PriceHistory {

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = &PriceSample> {
        self.samples.iter()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> PriceHistory {
        let mut h = PriceHistory::default();
        for (t, p) in [(0, 10.0), (30, 11.0), (65, 12.0), (100, 13.0)] {
            h.record(t, p);
        }
        h
    }

    #[test]
    fn nearest_sample_not_after_cutoff() {
        let h = seeded();
        let s = h.price_before(100, 60).unwrap();
        assert_eq!(s.time, 30);
        assert!((s.price - 11.0).abs() < f64::EPSILON);
    }

    #[test]
    fn exact_cutoff_match_is_included() {
        let h = seeded();
        assert_eq!(h.price_before(125, 60).unwrap().time, 65);
    }

    #[test]
    fn falls_back_to_oldest_when_nothing_old_enough() {
        let h = seeded();
        assert_eq!(h.price_before(40, 60).unwrap().time, 0);
    }

    #[test]
    fn empty_buffer_is_unavailable() {
        let h = PriceHistory::default();
        assert!(h.price_before(100, 60).is_none());
    }

    #[test]
    fn eviction_relative_to_newest_sample() {
        let mut h = seeded();
        h.record(250, 20.0);
        // cutoff = 130: 0, 30, 65 and 100 all fall outside.
        let times: Vec<i64> = h.samples().map(|s| s.time).collect();
        assert_eq!(times, vec![250]);

        let mut h = seeded();
        h.record(180, 20.0);
        // cutoff = 60: 65 and 100 stay.
        let times: Vec<i64> = h.samples().map(|s| s.time).collect();
        assert_eq!(times, vec![65, 100, 180]);
    }

    #[test]
    fn sample_on_cutoff_boundary_is_kept() {
        let mut h = PriceHistory::default();
        h.record(0, 1.0);
        h.record(120, 2.0);
        assert_eq!(h.len(), 2);
        h.record(121, 3.0);
        assert_eq!(h.samples().next().unwrap().time, 120);
    }

    #[test]
    fn late_sample_inserted_in_order() {
        let mut h = PriceHistory::default();
        h.record(10, 1.0);
        h.record(50, 2.0);
        h.record(30, 3.0);
        let times: Vec<i64> = h.samples().map(|s| s.time).collect();
        assert_eq!(times, vec![10, 30, 50]);
        assert_eq!(h.latest().unwrap().time, 50);
    }

    #[test]
    fn reset_clears_buffer() {
        let mut h = seeded();
        h.reset();
        assert!(h.is_empty());
        assert!(h.price_before(100, 60).is_none());
    }
}
