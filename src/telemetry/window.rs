//! Fixed-capacity sample ring.

use std::collections::VecDeque;

/// A bounded, time-ordered run of samples.
///
/// Capacity is fixed at construction. Pushing into a full window evicts the
/// oldest sample first, so memory never grows past `capacity` entries.
#[derive(Debug, Clone)]
pub struct SampleWindow<T> {
    samples: VecDeque<T>,
    capacity: usize,
}

impl<T> SampleWindow<T> {
    /// Create an empty window holding at most `capacity` samples (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest one when full.
    #[inline]
    pub fn push(&mut self, sample: T) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn oldest(&self) -> Option<&T> {
        self.samples.front()
    }

    pub fn newest(&self) -> Option<&T> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.samples.iter()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl SampleWindow<f64> {
    /// Arithmetic mean, 0 when empty.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Events per unit of time over the window: `(n - 1) / (newest - oldest)`.
    ///
    /// Samples are interpreted as timestamps. Returns 0 with fewer than two
    /// samples or a non-positive span.
    pub fn rate(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let (Some(oldest), Some(newest)) = (self.oldest(), self.newest()) else {
            return 0.0;
        };
        let span = newest - oldest;
        if span > 0.0 {
            (self.samples.len() - 1) as f64 / span
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest_when_full() {
        let mut window = SampleWindow::new(3);
        for v in 1..=5 {
            window.push(v as f64);
        }

        assert_eq!(window.len(), 3);
        assert_eq!(window.capacity(), 3);
        assert_eq!(window.iter().copied().collect::<Vec<_>>(), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_rate_from_timestamps() {
        let mut window = SampleWindow::new(10);
        let t0 = 1_000.0;
        window.push(t0);
        window.push(t0 + 1.0);
        window.push(t0 + 2.0);

        assert_eq!(window.rate(), 1.0);
    }

    #[test]
    fn test_rate_needs_two_samples() {
        let mut window = SampleWindow::new(10);
        assert_eq!(window.rate(), 0.0);
        window.push(4.0);
        assert_eq!(window.rate(), 0.0);

        // zero span
        window.push(4.0);
        assert_eq!(window.rate(), 0.0);
    }

    #[test]
    fn test_mean() {
        let mut window = SampleWindow::new(4);
        assert_eq!(window.mean(), 0.0);
        window.push(2.0);
        window.push(4.0);
        assert_eq!(window.mean(), 3.0);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut window = SampleWindow::new(0);
        window.push(1.0);
        window.push(2.0);
        assert_eq!(window.len(), 1);
        assert_eq!(window.newest(), Some(&2.0));
    }
}
