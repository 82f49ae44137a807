// src/baseline.rs
//
// Baseline Model — per (service, ruleKind) streaming statistics: rolling
// mean/stdDev via fold-in/fold-out sum and sum-of-squares, an EMA, and a
// short tail buffer for rate-of-change. O(1) per pushed sample (the
// sorted auxiliary structure for the robust MAD variant is the one
// exception, at O(n) per insert for the tiny window sizes this crate
// targets).

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    ErrorCount,
    LatencyP95,
}

/// Snapshot returned by `Baseline::snapshot`, capturing the baseline's
/// current mean/stdDev/spread and tail average as they stood before any
/// pending value is folded in.
#[derive(Debug, Clone, Copy)]
pub struct BaselineSnapshot {
    pub mean: f64,
    pub std_dev: f64,
    /// MAD ×1.4826 when the robust variant is enabled, `std_dev` otherwise —
    /// the spread Rule A actually compares against.
    pub spread: f64,
    pub count: usize,
    /// Average of the tail buffer *before* this value was pushed.
    pub recent_mean: f64,
    pub ema: f64,
}

pub struct Baseline {
    capacity: usize,
    tail_capacity: usize,
    alpha: f64,
    robust: bool,

    buffer: VecDeque<f64>,
    sum: f64,
    sum_squares: f64,
    ema: Option<f64>,
    tail: VecDeque<f64>,
    /// Sorted copy of `buffer`'s contents, maintained only when `robust` is
    /// set, so MAD queries stay a binary search + midpoint lookup instead
    /// of a full sort per query.
    sorted: Vec<f64>,
}

impl Baseline {
    pub fn new(capacity: usize, tail_capacity: usize, alpha: f64, robust: bool) -> Self {
        Self {
            capacity,
            tail_capacity,
            alpha,
            robust,
            buffer: VecDeque::with_capacity(capacity),
            sum: 0.0,
            sum_squares: 0.0,
            ema: None,
            tail: VecDeque::with_capacity(tail_capacity),
            sorted: Vec::with_capacity(capacity),
        }
    }

    pub fn count(&self) -> usize {
        self.buffer.len()
    }

    pub fn mean(&self) -> f64 {
        if self.buffer.is_empty() {
            0.0
        } else {
            self.sum / self.buffer.len() as f64
        }
    }

    pub fn variance(&self) -> f64 {
        if self.buffer.is_empty() {
            return 0.0;
        }
        let n = self.buffer.len() as f64;
        (self.sum_squares / n - self.mean().powi(2)).max(0.0)
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Median absolute deviation, scaled to be stdDev-comparable
    /// (×1.4826, the standard consistency constant for normal data).
    pub fn mad(&self) -> f64 {
        if self.sorted.is_empty() {
            return 0.0;
        }
        let median = Self::median_of(&self.sorted);
        let mut deviations: Vec<f64> = self.sorted.iter().map(|v| (v - median).abs()).collect();
        deviations.sort_by(|a, b| a.partial_cmp(b).unwrap());
        Self::median_of(&deviations) * 1.4826
    }

    fn median_of(sorted: &[f64]) -> f64 {
        let n = sorted.len();
        if n == 0 {
            return 0.0;
        }
        if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        }
    }

    /// The spread used by Rule A: MAD when the robust variant is enabled,
    /// stdDev otherwise.
    pub fn spread(&self) -> f64 {
        if self.robust {
            self.mad()
        } else {
            self.std_dev()
        }
    }

    fn sorted_insert(&mut self, value: f64) {
        let idx = self.sorted.partition_point(|v| *v < value);
        self.sorted.insert(idx, value);
    }

    fn sorted_remove(&mut self, value: f64) {
        if let Ok(idx) = self.sorted.binary_search_by(|v| v.partial_cmp(&value).unwrap()) {
            self.sorted.remove(idx);
        }
    }

    /// Current statistics, computed against the history accumulated so
    /// far — the basis the detector compares an incoming value against
    /// *before* that value is folded in. A baseline already containing
    /// the candidate would dilute the very deviation being measured.
    pub fn snapshot(&self) -> BaselineSnapshot {
        let recent_mean = if self.tail.is_empty() {
            0.0
        } else {
            self.tail.iter().sum::<f64>() / self.tail.len() as f64
        };
        BaselineSnapshot {
            mean: self.mean(),
            std_dev: self.std_dev(),
            spread: self.spread(),
            count: self.buffer.len(),
            recent_mean,
            ema: self.ema.unwrap_or(0.0),
        }
    }

    /// Fold a new finalized rate into the baseline, evicting the oldest
    /// sample if the buffer was already full.
    pub fn push(&mut self, value: f64) {
        if self.buffer.len() == self.capacity {
            if let Some(evicted) = self.buffer.pop_front() {
                self.sum -= evicted;
                self.sum_squares -= evicted * evicted;
                if self.robust {
                    self.sorted_remove(evicted);
                }
            }
        }
        self.buffer.push_back(value);
        self.sum += value;
        self.sum_squares += value * value;
        if self.robust {
            self.sorted_insert(value);
        }

        self.tail.push_back(value);
        if self.tail.len() > self.tail_capacity {
            self.tail.pop_front();
        }

        self.ema = Some(match self.ema {
            None => value,
            Some(prev) => self.alpha * value + (1.0 - self.alpha) * prev,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// sum and sumSquares always stay consistent with the buffer's
        /// actual contents, for any sequence of pushes, including ones
        /// long enough to wrap past capacity repeatedly.
        #[test]
        fn sum_and_sum_squares_always_match_buffer_contents(values in prop::collection::vec(-1000.0f64..1000.0, 0..200)) {
            let mut b = Baseline::new(10, 5, 0.3, false);
            for v in &values {
                b.push(*v);
            }
            let expected_sum: f64 = b.buffer.iter().sum();
            let expected_sq: f64 = b.buffer.iter().map(|v| v * v).sum();
            prop_assert!((b.sum - expected_sum).abs() < 1e-6);
            prop_assert!((b.sum_squares - expected_sq).abs() < 1e-6);
            prop_assert!(b.variance() >= 0.0);
        }
    }

    #[test]
    fn sum_and_sum_squares_track_buffer_after_eviction() {
        let mut b = Baseline::new(3, 5, 0.3, false);
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            b.push(v);
        }
        // Buffer now holds [3, 4, 5].
        let expected_sum: f64 = [3.0, 4.0, 5.0].iter().sum();
        let expected_sq: f64 = [3.0, 4.0, 5.0].iter().map(|v| v * v).sum();
        assert!((b.sum - expected_sum).abs() < 1e-9);
        assert!((b.sum_squares - expected_sq).abs() < 1e-9);
    }

    #[test]
    fn variance_never_negative() {
        let mut b = Baseline::new(5, 5, 0.3, false);
        b.push(2.0);
        b.push(2.0);
        assert!(b.variance() >= 0.0);
    }

    #[test]
    fn recent_mean_excludes_current_push() {
        let mut b = Baseline::new(60, 5, 0.3, false);
        for _ in 0..5 {
            b.push(20.0);
        }
        let snap = b.snapshot();
        b.push(32.0);
        assert!((snap.recent_mean - 20.0).abs() < 1e-9);
    }

    #[test]
    fn robust_mad_of_constant_buffer_is_zero() {
        let mut b = Baseline::new(10, 5, 0.3, true);
        for _ in 0..10 {
            b.push(5.0);
        }
        assert_eq!(b.mad(), 0.0);
    }
}
