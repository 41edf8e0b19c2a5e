//! Adaptive batch sizing
//!
//! Closed-loop controller for the dispatcher's fetch size. Grows gently
//! while iterations beat the latency target, shrinks hard when they miss
//! it, and snaps back to the minimum as soon as the queue is draining.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::debug;

pub struct AdaptiveBatchSizer {
    min: usize,
    max: usize,
    target_latency: Duration,
    current: AtomicUsize,
}

impl AdaptiveBatchSizer {
    pub fn new(min: usize, max: usize, target_latency: Duration) -> Self {
        Self {
            min,
            max,
            target_latency,
            current: AtomicUsize::new(min),
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.current.store(self.min, Ordering::Relaxed);
    }

    /// Feed one iteration's result back into the controller.
    pub fn adjust(&self, elapsed: Duration, records_returned: usize) {
        let current = self.current.load(Ordering::Relaxed);

        let next = if records_returned < current {
            // Queue is draining: a full batch was offered but not filled
            self.min
        } else if elapsed < self.target_latency {
            ((current as f64 * 1.2) as usize).min(self.max)
        } else {
            ((current as f64 * 0.7) as usize).max(self.min)
        };

        if next != current {
            self.current.store(next, Ordering::Relaxed);
            debug!(
                elapsed_ms = elapsed.as_millis() as u64,
                records = records_returned,
                from = current,
                to = next,
                "batch size adjusted"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizer() -> AdaptiveBatchSizer {
        AdaptiveBatchSizer::new(10, 2_000, Duration::from_millis(200))
    }

    #[test]
    fn starts_at_minimum() {
        assert_eq!(sizer().current(), 10);
    }

    #[test]
    fn fast_full_batches_grow_multiplicatively() {
        let s = sizer();
        s.adjust(Duration::from_millis(50), 10);
        assert_eq!(s.current(), 12);
        s.adjust(Duration::from_millis(50), 12);
        assert_eq!(s.current(), 14);
    }

    #[test]
    fn growth_is_capped_at_max() {
        let s = AdaptiveBatchSizer::new(10, 15, Duration::from_millis(200));
        for _ in 0..10 {
            let size = s.current();
            s.adjust(Duration::from_millis(1), size);
        }
        assert_eq!(s.current(), 15);
    }

    #[test]
    fn slow_batches_shrink_faster_than_they_grew() {
        let s = sizer();
        for _ in 0..10 {
            let size = s.current();
            s.adjust(Duration::from_millis(1), size);
        }
        let grown = s.current();
        s.adjust(Duration::from_millis(500), grown);
        assert_eq!(s.current(), (grown as f64 * 0.7) as usize);
    }

    #[test]
    fn shrink_is_floored_at_min() {
        let s = sizer();
        s.adjust(Duration::from_millis(500), 10);
        assert_eq!(s.current(), 10);
    }

    #[test]
    fn partial_batch_resets_to_min() {
        let s = sizer();
        for _ in 0..5 {
            let size = s.current();
            s.adjust(Duration::from_millis(1), size);
        }
        assert!(s.current() > 10);

        s.adjust(Duration::from_millis(1), s.current() - 1);
        assert_eq!(s.current(), 10);
    }

    #[test]
    fn reset_returns_to_min() {
        let s = sizer();
        s.adjust(Duration::from_millis(1), 10);
        assert!(s.current() > 10);
        s.reset();
        assert_eq!(s.current(), 10);
    }
}
