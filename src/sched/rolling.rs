//! Rolling time-window average used as the scheduler's online cost
//! estimator.

use std::time::Duration;

use quanta::Clock;

#[derive(Clone, Copy, Default)]
struct Bucket {
    sum: f64,
    count: u64,
}

/// A rolling average over a fixed number of fixed-width time buckets.
///
/// Samples land in the bucket for the current time slot; slots older than
/// `len * granularity` fall out of the window as time advances. The average
/// is over every sample still inside the window, and `None` until the first
/// sample lands.
pub(crate) struct TimeWindow {
    clock: Clock,
    origin: quanta::Instant,
    granularity: Duration,
    buckets: Vec<Bucket>,
    cursor: usize,
    last_tick: u64,
}

impl TimeWindow {
    pub(crate) fn new(len: usize, granularity: Duration) -> Self {
        Self::with_clock(Clock::new(), len, granularity)
    }

    fn with_clock(clock: Clock, len: usize, granularity: Duration) -> Self {
        assert!(len > 0, "window must have at least one bucket");
        assert!(!granularity.is_zero(), "granularity must be non-zero");
        let origin = clock.now();
        Self {
            clock,
            origin,
            granularity,
            buckets: vec![Bucket::default(); len],
            cursor: 0,
            last_tick: 0,
        }
    }

    /// Number of granularity ticks elapsed since construction.
    fn tick(&self) -> u64 {
        let elapsed = self.clock.now() - self.origin;
        (elapsed.as_nanos() / self.granularity.as_nanos()) as u64
    }

    /// Rotates the window forward, clearing every bucket whose time slot
    /// has passed.
    fn advance(&mut self) {
        let tick = self.tick();
        let steps = tick - self.last_tick;
        if steps == 0 {
            return;
        }

        if steps as usize >= self.buckets.len() {
            self.buckets.fill(Bucket::default());
        } else {
            for _ in 0..steps {
                self.cursor = (self.cursor + 1) % self.buckets.len();
                self.buckets[self.cursor] = Bucket::default();
            }
        }
        self.cursor = (tick % self.buckets.len() as u64) as usize;
        self.last_tick = tick;
    }

    /// Adds a sample to the current time slot.
    pub(crate) fn append(&mut self, value: f64) {
        self.advance();
        let bucket = &mut self.buckets[self.cursor];
        bucket.sum += value;
        bucket.count += 1;
    }

    /// The mean of every sample in the window, or `None` when the window is
    /// empty.
    pub(crate) fn average(&mut self) -> Option<f64> {
        self.advance();
        let (sum, count) = self
            .buckets
            .iter()
            .fold((0.0, 0u64), |(s, c), b| (s + b.sum, c + b.count));
        (count > 0).then(|| sum / count as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mocked(len: usize, granularity: Duration) -> (TimeWindow, std::sync::Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        (TimeWindow::with_clock(clock, len, granularity), mock)
    }

    #[test]
    fn test_empty_window_has_no_average() {
        let (mut w, _mock) = mocked(10, Duration::from_millis(1));
        assert_eq!(w.average(), None);
    }

    #[test]
    fn test_average_over_samples() {
        let (mut w, _mock) = mocked(10, Duration::from_millis(1));
        w.append(10.0);
        w.append(20.0);
        w.append(30.0);
        assert_eq!(w.average(), Some(20.0));
    }

    #[test]
    fn test_samples_spread_across_buckets() {
        let (mut w, mock) = mocked(10, Duration::from_millis(1));
        w.append(10.0);
        mock.increment(Duration::from_millis(3));
        w.append(30.0);
        assert_eq!(w.average(), Some(20.0));
    }

    #[test]
    fn test_old_samples_fall_out() {
        let (mut w, mock) = mocked(10, Duration::from_millis(1));
        w.append(100.0);

        // Stay inside the window: the sample still counts
        mock.increment(Duration::from_millis(5));
        assert_eq!(w.average(), Some(100.0));

        // Pass the whole window: the sample is gone
        mock.increment(Duration::from_millis(20));
        assert_eq!(w.average(), None);

        w.append(7.0);
        assert_eq!(w.average(), Some(7.0));
    }

    #[test]
    fn test_partial_rotation_keeps_recent_samples() {
        let (mut w, mock) = mocked(4, Duration::from_millis(1));
        w.append(1.0);
        mock.increment(Duration::from_millis(2));
        w.append(3.0);

        // Two more ticks: the first sample (age 4) leaves, the second
        // (age 2) stays.
        mock.increment(Duration::from_millis(2));
        assert_eq!(w.average(), Some(3.0));
    }
}
