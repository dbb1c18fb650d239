//! Per-channel liveness counters.

use std::time::{Duration, Instant};

/// Connection health for one channel (source or sink).
///
/// `last_message` uses the monotonic clock; wall time never drives
/// staleness or reconnect decisions.
#[derive(Debug, Clone, Default)]
pub struct ConnectionHealth {
    pub is_connected: bool,
    last_message: Option<Instant>,
    pub reconnect_attempts: u32,
    pub total_reconnects: u32,
    pub messages_since_connect: u64,
    pub error_count: u64,
    /// Decaying errors-per-minute estimate.
    pub error_rate: f64,
    last_error: Option<Instant>,
}

impl ConnectionHealth {
    pub fn record_message(&mut self) {
        self.last_message = Some(Instant::now());
        self.messages_since_connect += 1;
    }

    pub fn record_error(&mut self) {
        let now = Instant::now();
        self.error_count += 1;
        match self.last_error {
            Some(prev) if now.duration_since(prev) <= Duration::from_secs(60) => {
                self.error_rate = (self.error_rate + 1.0).min(100.0);
            }
            _ => self.error_rate = 1.0,
        }
        self.last_error = Some(now);
    }

    /// True only once a message has ever been seen and the channel has been
    /// silent for longer than `timeout`.
    pub fn is_stale(&self, timeout: Duration) -> bool {
        match self.last_message {
            Some(t) => t.elapsed() > timeout,
            None => false,
        }
    }

    /// Zero session-scoped counters ahead of a reconnect attempt.
    pub fn reset_for_reconnect(&mut self) {
        self.is_connected = false;
        self.reconnect_attempts += 1;
        self.total_reconnects += 1;
        self.messages_since_connect = 0;
    }

    /// Mark a successful (re)connect.
    pub fn on_connected(&mut self) {
        self.is_connected = true;
        self.reconnect_attempts = 0;
    }
}

/// Capped geometric backoff before reconnect attempt `attempts`.
pub fn reconnect_delay(attempts: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2f64.powi(attempts.min(31) as i32);
    Duration::from_secs_f64(base.as_secs_f64() * factor).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_stale_before_first_message() {
        let h = ConnectionHealth::default();
        assert!(!h.is_stale(Duration::ZERO));
    }

    #[test]
    fn stale_after_silence() {
        let mut h = ConnectionHealth::default();
        h.record_message();
        std::thread::sleep(Duration::from_millis(5));
        assert!(h.is_stale(Duration::from_millis(1)));
        assert!(!h.is_stale(Duration::from_secs(60)));
    }

    #[test]
    fn reconnect_counters() {
        let mut h = ConnectionHealth::default();
        h.is_connected = true;
        h.record_message();
        h.reset_for_reconnect();
        assert!(!h.is_connected);
        assert_eq!(h.reconnect_attempts, 1);
        assert_eq!(h.total_reconnects, 1);
        assert_eq!(h.messages_since_connect, 0);

        h.on_connected();
        assert!(h.is_connected);
        assert_eq!(h.reconnect_attempts, 0);
        assert_eq!(h.total_reconnects, 1);
    }

    #[test]
    fn error_rate_accumulates_within_a_minute() {
        let mut h = ConnectionHealth::default();
        h.record_error();
        assert_eq!(h.error_rate, 1.0);
        h.record_error();
        assert_eq!(h.error_rate, 2.0);
        assert_eq!(h.error_count, 2);
    }

    #[test]
    fn backoff_is_geometric_and_capped() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);
        let delays: Vec<u64> = (0..8)
            .map(|n| reconnect_delay(n, base, cap).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }
}
