//! Rate-limited publisher: token bucket fronting a bounded overflow queue.
//!
//! Protects the dashboard channel's message-rate cap. One token buys one
//! publish; tokens refill continuously at the configured rate up to the
//! burst capacity. When the bucket is empty messages queue, and when the
//! queue is full the newest message is dropped (and counted) — the journal
//! already holds it.
//!
//! The bucket lives under a plain mutex and is never held across an await;
//! only the publish I/O itself suspends.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::warn;

use telemetry_types::{TelemetrySample, TELEMETRY_EVENT};

use crate::channels::PublishSink;

// ── Outcome ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Sent immediately within the rate cap.
    Published,
    /// No token available; parked in the overflow queue.
    Queued,
    /// The transport send failed; parked for retry. The caller should treat
    /// the sink as disconnected.
    QueuedAfterError,
    /// Overflow queue full; the message was shed.
    Dropped,
}

// ── Token bucket ──────────────────────────────────────────────────────────────

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn refill(&mut self, rate: f64, burst: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * rate).min(burst);
    }
}

// ── Statistics ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct PublisherSnapshot {
    pub queue_depth: usize,
    pub available_tokens: f64,
    pub published: u64,
    pub delayed: u64,
    pub dropped: u64,
    pub burst_events: u64,
    pub drain_cycles: u64,
}

// ── Publisher ─────────────────────────────────────────────────────────────────

pub struct RateLimitedPublisher {
    rate: f64,
    burst: f64,
    queue_cap: usize,
    drain_interval: Duration,

    bucket: Mutex<TokenBucket>,
    queue: Mutex<VecDeque<TelemetrySample>>,

    published: AtomicU64,
    delayed: AtomicU64,
    dropped: AtomicU64,
    burst_events: AtomicU64,
    drain_cycles: AtomicU64,
}

impl RateLimitedPublisher {
    pub fn new(rate: f64, burst: usize, queue_cap: usize, drain_interval: Duration) -> Self {
        Self {
            rate,
            burst: burst as f64,
            queue_cap,
            drain_interval,
            bucket: Mutex::new(TokenBucket {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
            queue: Mutex::new(VecDeque::new()),
            published: AtomicU64::new(0),
            delayed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            burst_events: AtomicU64::new(0),
            drain_cycles: AtomicU64::new(0),
        }
    }

    /// Publish one sample, consuming a token when available; otherwise the
    /// sample is queued. Only a full queue loses data.
    pub async fn publish<S: PublishSink>(
        &self,
        sink: &S,
        sample: TelemetrySample,
    ) -> PublishOutcome {
        if self.try_take_token() {
            match sink.publish(TELEMETRY_EVENT, &sample).await {
                Ok(()) => {
                    self.published.fetch_add(1, Ordering::Relaxed);
                    PublishOutcome::Published
                }
                Err(e) => {
                    warn!("publish failed, queueing for retry: {e}");
                    if self.enqueue(sample) {
                        PublishOutcome::QueuedAfterError
                    } else {
                        PublishOutcome::Dropped
                    }
                }
            }
        } else {
            let delayed = self.delayed.fetch_add(1, Ordering::Relaxed) + 1;
            if delayed % 100 == 1 {
                self.burst_events.fetch_add(1, Ordering::Relaxed);
                warn!("publish rate cap hit, queueing (depth {})", self.queue_depth());
            }
            if self.enqueue(sample) {
                PublishOutcome::Queued
            } else {
                PublishOutcome::Dropped
            }
        }
    }

    /// Drain the overflow queue while messages remain and tokens permit.
    /// A send failure re-queues the message and stops the cycle. Returns the
    /// number of messages published.
    pub async fn drain<S: PublishSink>(&self, sink: &S) -> usize {
        self.drain_cycles.fetch_add(1, Ordering::Relaxed);
        let mut sent = 0usize;

        loop {
            let Some(sample) = self.queue.lock().pop_front() else {
                break;
            };
            if !self.try_take_token() {
                self.queue.lock().push_front(sample);
                break;
            }
            if let Err(e) = sink.publish(TELEMETRY_EVENT, &sample).await {
                warn!("drain publish failed, re-queueing: {e}");
                if !self.requeue_front(sample) {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                break;
            }
            self.published.fetch_add(1, Ordering::Relaxed);
            sent += 1;
            tokio::time::sleep(self.drain_interval).await;
        }
        sent
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn snapshot(&self) -> PublisherSnapshot {
        let available_tokens = {
            let mut bucket = self.bucket.lock();
            bucket.refill(self.rate, self.burst);
            bucket.tokens
        };
        PublisherSnapshot {
            queue_depth: self.queue_depth(),
            available_tokens,
            published: self.published.load(Ordering::Relaxed),
            delayed: self.delayed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            burst_events: self.burst_events.load(Ordering::Relaxed),
            drain_cycles: self.drain_cycles.load(Ordering::Relaxed),
        }
    }

    /// Take one token if the refilled bucket allows. Never suspends.
    fn try_take_token(&self) -> bool {
        let mut bucket = self.bucket.lock();
        bucket.refill(self.rate, self.burst);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn enqueue(&self, sample: TelemetrySample) -> bool {
        let mut queue = self.queue.lock();
        if queue.len() >= self.queue_cap {
            drop(queue);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        queue.push_back(sample);
        true
    }

    fn requeue_front(&self, sample: TelemetrySample) -> bool {
        let mut queue = self.queue.lock();
        if queue.len() >= self.queue_cap {
            return false;
        }
        queue.push_front(sample);
        true
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelError;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct FakeSink {
        sent: Mutex<Vec<u64>>,
        fail: AtomicBool,
    }

    impl PublishSink for FakeSink {
        async fn publish(
            &self,
            _event: &str,
            sample: &TelemetrySample,
        ) -> Result<(), ChannelError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(ChannelError::NotConnected);
            }
            self.sent.lock().push(sample.message_id);
            Ok(())
        }
    }

    fn sample(id: u64) -> TelemetrySample {
        TelemetrySample { message_id: id, ..TelemetrySample::default() }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_publishes_up_to_capacity_then_queues() {
        let publisher = RateLimitedPublisher::new(500.0, 100, 10_000, Duration::from_millis(2));
        let sink = FakeSink::default();

        let mut published = 0;
        let mut queued = 0;
        for i in 0..600 {
            match publisher.publish(&sink, sample(i)).await {
                PublishOutcome::Published => published += 1,
                PublishOutcome::Queued => queued += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        // Time is frozen: exactly the burst capacity goes out immediately.
        assert_eq!(published, 100);
        assert_eq!(queued, 500);
        assert_eq!(publisher.queue_depth(), 500);
        assert_eq!(publisher.snapshot().dropped, 0);

        // One virtual second later the queue drains at the refill rate.
        tokio::time::advance(Duration::from_secs(1)).await;
        let drained = publisher.drain(&sink).await;
        assert_eq!(drained, 500);
        assert_eq!(publisher.queue_depth(), 0);
        assert_eq!(sink.sent.lock().len(), 600);
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_never_exceed_burst() {
        let publisher = RateLimitedPublisher::new(500.0, 100, 1000, Duration::from_millis(2));
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(publisher.snapshot().available_tokens <= 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_drops_new_messages() {
        let publisher = RateLimitedPublisher::new(500.0, 0, 5, Duration::from_millis(2));
        let sink = FakeSink::default();

        for i in 0..5 {
            assert_eq!(publisher.publish(&sink, sample(i)).await, PublishOutcome::Queued);
        }
        for i in 5..8 {
            assert_eq!(publisher.publish(&sink, sample(i)).await, PublishOutcome::Dropped);
        }
        assert_eq!(publisher.queue_depth(), 5);
        assert_eq!(publisher.snapshot().dropped, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_queues_for_retry() {
        let publisher = RateLimitedPublisher::new(500.0, 10, 100, Duration::from_millis(2));
        let sink = FakeSink::default();
        sink.fail.store(true, Ordering::Relaxed);

        let outcome = publisher.publish(&sink, sample(1)).await;
        assert_eq!(outcome, PublishOutcome::QueuedAfterError);
        assert_eq!(publisher.queue_depth(), 1);

        // Sink recovers; the drain cycle delivers the parked message.
        sink.fail.store(false, Ordering::Relaxed);
        assert_eq!(publisher.drain(&sink).await, 1);
        assert_eq!(sink.sent.lock().as_slice(), &[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_stops_on_send_failure_and_preserves_order() {
        let publisher = RateLimitedPublisher::new(500.0, 3, 100, Duration::from_millis(2));
        let sink = FakeSink::default();
        // Burst capacity 3: the first three go out, the rest queue.
        for i in 0..6 {
            publisher.publish(&sink, sample(i)).await;
        }
        assert_eq!(publisher.queue_depth(), 3);

        tokio::time::advance(Duration::from_secs(1)).await;
        sink.fail.store(true, Ordering::Relaxed);
        assert_eq!(publisher.drain(&sink).await, 0);
        // Failed head went back to the front; order intact.
        assert_eq!(publisher.queue_depth(), 3);

        sink.fail.store(false, Ordering::Relaxed);
        assert_eq!(publisher.drain(&sink).await, 3);
        assert_eq!(sink.sent.lock().as_slice(), &[0, 1, 2, 3, 4, 5]);
    }
}
