//! Fixed-capacity circular buffers for rolling statistics.

use std::cell::Cell;

// ── Rolling numeric window ────────────────────────────────────────────────────

/// Circular buffer over the last N values of one field.
///
/// Mean/std are cached and the cache is invalidated on push. Std over fewer
/// than 2 samples is 0; mean over an empty window is 0.
#[derive(Debug)]
pub struct RollingWindow {
    buf: Box<[f64]>,
    count: usize,
    index: usize,
    stats: Cell<Option<(f64, f64)>>,
}

impl RollingWindow {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "rolling window size must be positive");
        Self {
            buf: vec![0.0; size].into_boxed_slice(),
            count: 0,
            index: 0,
            stats: Cell::new(None),
        }
    }

    pub fn push(&mut self, value: f64) {
        self.buf[self.index] = value;
        self.index = (self.index + 1) % self.buf.len();
        self.count = (self.count + 1).min(self.buf.len());
        self.stats.set(None);
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn mean(&self) -> f64 {
        self.cached_stats().0
    }

    /// Population standard deviation of the window contents.
    pub fn std(&self) -> f64 {
        self.cached_stats().1
    }

    pub fn sum(&self) -> f64 {
        self.mean() * self.count as f64
    }

    /// The most recently pushed value.
    pub fn last(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let idx = (self.index + self.buf.len() - 1) % self.buf.len();
        Some(self.buf[idx])
    }

    /// The `min(n, count)` most recent values in push order.
    pub fn last_n(&self, n: usize) -> Vec<f64> {
        let n = n.min(self.count);
        let len = self.buf.len();
        // Logical position 0 is the oldest retained value.
        let oldest = (self.index + len - self.count) % len;
        (self.count - n..self.count)
            .map(|i| self.buf[(oldest + i) % len])
            .collect()
    }

    pub fn reset(&mut self) {
        self.buf.fill(0.0);
        self.count = 0;
        self.index = 0;
        self.stats.set(None);
    }

    fn cached_stats(&self) -> (f64, f64) {
        if let Some(s) = self.stats.get() {
            return s;
        }
        let computed = self.compute_stats();
        self.stats.set(Some(computed));
        computed
    }

    fn compute_stats(&self) -> (f64, f64) {
        if self.count == 0 {
            return (0.0, 0.0);
        }
        // Order is irrelevant for mean/std, so the wrapped layout can be
        // read as one contiguous prefix.
        let slice = &self.buf[..self.count];
        let n = slice.len() as f64;
        let mean = slice.iter().sum::<f64>() / n;
        let std = if slice.len() < 2 {
            0.0
        } else {
            (slice.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
        };
        (mean, std)
    }
}

// ── GPS track window ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsPoint {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub t: f64,
}

/// Circular buffer of recent GPS fixes for track-consistency checks.
#[derive(Debug)]
pub struct GpsTrackWindow {
    points: Box<[GpsPoint]>,
    count: usize,
    index: usize,
}

impl GpsTrackWindow {
    pub fn new(size: usize) -> Self {
        assert!(size >= 2, "gps track window needs at least 2 slots");
        let zero = GpsPoint { lat: 0.0, lon: 0.0, alt: 0.0, t: 0.0 };
        Self {
            points: vec![zero; size].into_boxed_slice(),
            count: 0,
            index: 0,
        }
    }

    pub fn push(&mut self, lat: f64, lon: f64, alt: f64, t: f64) {
        self.points[self.index] = GpsPoint { lat, lon, alt, t };
        self.index = (self.index + 1) % self.points.len();
        self.count = (self.count + 1).min(self.points.len());
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// The most recently pushed fix.
    pub fn last(&self) -> Option<GpsPoint> {
        if self.count == 0 {
            return None;
        }
        let len = self.points.len();
        Some(self.points[(self.index + len - 1) % len])
    }

    /// The fix before the most recent one; `None` until two have been pushed.
    pub fn previous(&self) -> Option<GpsPoint> {
        if self.count < 2 {
            return None;
        }
        let len = self.points.len();
        Some(self.points[(self.index + len - 2) % len])
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.index = 0;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn partial_fill_counts() {
        let mut w = RollingWindow::new(5);
        assert_eq!(w.count(), 0);
        assert_eq!(w.mean(), 0.0);
        assert_eq!(w.std(), 0.0);

        for i in 0..3 {
            w.push(i as f64);
        }
        assert_eq!(w.count(), 3);
        assert_relative_eq!(w.mean(), 1.0);
    }

    #[test]
    fn wraparound_keeps_capacity_and_latest() {
        let mut w = RollingWindow::new(4);
        for i in 0..10 {
            w.push(i as f64);
        }
        // After N+K pushes count stays at N and last_n(1) is the last push.
        assert_eq!(w.count(), 4);
        assert_eq!(w.last_n(1), vec![9.0]);
        assert_eq!(w.last(), Some(9.0));
        // Window holds 6,7,8,9.
        assert_relative_eq!(w.mean(), 7.5);
        assert_eq!(w.last_n(4), vec![6.0, 7.0, 8.0, 9.0]);
        // Requests larger than the fill are clamped.
        assert_eq!(w.last_n(10).len(), 4);
    }

    #[test]
    fn std_single_sample_is_zero() {
        let mut w = RollingWindow::new(8);
        w.push(42.0);
        assert_eq!(w.std(), 0.0);
        w.push(44.0);
        assert_relative_eq!(w.std(), 1.0);
    }

    #[test]
    fn cache_invalidates_on_push() {
        let mut w = RollingWindow::new(8);
        w.push(10.0);
        assert_relative_eq!(w.mean(), 10.0);
        w.push(20.0);
        assert_relative_eq!(w.mean(), 15.0);
    }

    #[test]
    fn reset_clears_everything() {
        let mut w = RollingWindow::new(3);
        w.push(1.0);
        w.push(2.0);
        w.reset();
        assert_eq!(w.count(), 0);
        assert_eq!(w.last(), None);
        assert!(w.last_n(2).is_empty());
    }

    #[test]
    fn gps_previous_needs_two_points() {
        let mut g = GpsTrackWindow::new(20);
        assert!(g.previous().is_none());

        g.push(40.0, -74.0, 100.0, 0.0);
        assert!(g.previous().is_none());
        assert_eq!(g.last().map(|p| p.lat), Some(40.0));

        g.push(40.1, -74.1, 101.0, 0.2);
        let prev = g.previous().unwrap();
        assert_relative_eq!(prev.lat, 40.0);
        assert_relative_eq!(g.last().unwrap().lat, 40.1);
    }

    #[test]
    fn gps_window_wraps() {
        let mut g = GpsTrackWindow::new(3);
        for i in 0..7 {
            g.push(i as f64, 0.0, 0.0, i as f64);
        }
        assert_eq!(g.count(), 3);
        assert_relative_eq!(g.last().unwrap().lat, 6.0);
        assert_relative_eq!(g.previous().unwrap().lat, 5.0);
    }
}
