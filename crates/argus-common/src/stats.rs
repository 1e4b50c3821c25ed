//! Fixed-size ring buffers with incremental moments.
//!
//! The anomaly detector keeps one baseline ring and one short recent ring
//! per service; both need O(1) push and O(1) mean/stddev regardless of ring
//! length, so the moments are maintained incrementally on push/evict
//! instead of being recomputed.

use std::collections::VecDeque;

/// Fixed-capacity circular buffer. Pushing into a full buffer evicts and
/// returns the oldest element.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an element, returning the evicted one when full
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

/// Rolling sum over a fixed-size window; O(1) mean
#[derive(Debug, Clone)]
pub struct RollingSum {
    ring: RingBuffer<f64>,
    sum: f64,
}

impl RollingSum {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RingBuffer::new(capacity),
            sum: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) {
        if let Some(evicted) = self.ring.push(value) {
            self.sum -= evicted;
        }
        self.sum += value;
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn mean(&self) -> f64 {
        if self.ring.is_empty() {
            0.0
        } else {
            self.sum / self.ring.len() as f64
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    pub fn clear(&mut self) {
        self.ring.clear();
        self.sum = 0.0;
    }
}

/// Rolling mean/standard deviation over a fixed-size window.
///
/// Maintains running sum and sum-of-squares; stddev uses the population
/// form sqrt(E[x²] − E[x]²) clamped at zero against floating-point noise.
#[derive(Debug, Clone)]
pub struct RollingStats {
    ring: RingBuffer<f64>,
    sum: f64,
    sum_sq: f64,
}

impl RollingStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RingBuffer::new(capacity),
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) {
        if let Some(evicted) = self.ring.push(value) {
            self.sum -= evicted;
            self.sum_sq -= evicted * evicted;
        }
        self.sum += value;
        self.sum_sq += value * value;
    }

    pub fn mean(&self) -> f64 {
        if self.ring.is_empty() {
            0.0
        } else {
            self.sum / self.ring.len() as f64
        }
    }

    pub fn stddev(&self) -> f64 {
        if self.ring.is_empty() {
            return 0.0;
        }
        let n = self.ring.len() as f64;
        let mean = self.sum / n;
        (self.sum_sq / n - mean * mean).max(0.0).sqrt()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    pub fn clear(&mut self) {
        self.ring.clear();
        self.sum = 0.0;
        self.sum_sq = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ring_evicts_oldest() {
        let mut ring = RingBuffer::new(3);
        assert_eq!(ring.capacity(), 3);
        assert!(ring.is_empty());
        assert_eq!(ring.push(1), None);
        assert_eq!(ring.push(2), None);
        assert_eq!(ring.push(3), None);
        assert!(ring.is_full());
        assert_eq!(ring.push(4), Some(1));
        assert_eq!(ring.push(5), Some(2));
        let contents: Vec<_> = ring.iter().copied().collect();
        assert_eq!(contents, vec![3, 4, 5]);

        ring.clear();
        assert!(ring.is_empty());
    }

    #[test]
    fn rolling_sum_tracks_window() {
        let mut window = RollingSum::new(2);
        window.push(1.0);
        window.push(2.0);
        assert_eq!(window.sum(), 3.0);
        window.push(10.0);
        assert_eq!(window.sum(), 12.0);
        assert_eq!(window.mean(), 6.0);
    }

    #[test]
    fn stats_of_constant_series_has_zero_stddev() {
        let mut stats = RollingStats::new(10);
        for _ in 0..10 {
            stats.push(0.1);
        }
        assert!(stats.is_full());
        assert!((stats.mean() - 0.1).abs() < 1e-12);
        assert!(stats.stddev() < 1e-9);

        stats.clear();
        assert!(stats.is_empty());
        assert_eq!(stats.mean(), 0.0);
    }

    proptest! {
        #[test]
        fn incremental_moments_match_naive(
            values in prop::collection::vec(0.0f64..1.0, 1..200),
            capacity in 1usize..50,
        ) {
            let mut stats = RollingStats::new(capacity);
            for &v in &values {
                stats.push(v);
            }
            let tail: Vec<f64> = values
                .iter()
                .rev()
                .take(capacity)
                .rev()
                .copied()
                .collect();
            let n = tail.len() as f64;
            let mean = tail.iter().sum::<f64>() / n;
            let var = tail.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

            prop_assert!((stats.mean() - mean).abs() < 1e-9);
            prop_assert!((stats.stddev() - var.sqrt()).abs() < 1e-6);
        }
    }
}
