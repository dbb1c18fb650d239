//! The orchestrator.
//!
//! Owns every long-lived component and runs the cooperative task set:
//!
//! - ingest (live source) or mock generation
//! - republish to the dashboard channel through the rate limiter
//! - database batch writer with retry/backoff
//! - health monitor (staleness watchdog, transport state)
//! - periodic stats
//!
//! A single shutdown signal flips `running` and every task exits at its next
//! loop head. The shutdown path always runs the final database flush, the
//! conditional CSV export, and channel close.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify};
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use telemetry_analytics::{Normalizer, OutlierDetector, TelemetryCalculator};
use telemetry_mock::{MockDataGenerator, MockModeConfig, MockScenario};
use telemetry_types::{decode_wire_frame, RawSample, TelemetrySample, CSV_FIELD_ORDER, SOURCE_REAL};

use crate::channels::{RedisSink, RedisSource};
use crate::config::BridgeConfig;
use crate::db::DbClient;
use crate::health::{reconnect_delay, ConnectionHealth};
use crate::journal::LocalJournal;
use crate::publisher::{PublishOutcome, RateLimitedPublisher};

// ── Session & stats ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct BridgeStats {
    pub messages_received: AtomicU64,
    pub messages_republished: AtomicU64,
    pub messages_stored_db: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub parse_errors: AtomicU64,
    pub validation_errors: AtomicU64,
    pub errors: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

struct RetryState {
    queue: VecDeque<Vec<TelemetrySample>>,
    backoff: Duration,
    next_retry_at: Instant,
    write_failures: u64,
}

// ── Bridge ────────────────────────────────────────────────────────────────────

pub struct Bridge {
    config: BridgeConfig,
    session: SessionInfo,
    mode: String,

    normalizer: Mutex<Normalizer>,
    journal: Mutex<LocalJournal>,
    generator: Option<Mutex<MockDataGenerator>>,

    source: RedisSource,
    sink: RedisSink,
    db: Option<DbClient>,
    publisher: RateLimitedPublisher,

    repub_queue: Mutex<VecDeque<TelemetrySample>>,
    db_buffer: Mutex<Vec<TelemetrySample>>,
    retry: AsyncMutex<RetryState>,

    source_health: Mutex<ConnectionHealth>,
    sink_health: Mutex<ConnectionHealth>,
    source_reconnect_guard: AsyncMutex<()>,
    sink_reconnect_guard: AsyncMutex<()>,
    /// Wakes the ingest loop out of a pending receive after the watchdog
    /// marks the source disconnected.
    source_kick: Notify,

    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    pub stats: BridgeStats,
}

impl Bridge {
    /// Build all components. `scenario` switches the bridge into mock mode.
    pub fn new(
        config: BridgeConfig,
        session_label: Option<String>,
        scenario: Option<MockScenario>,
    ) -> anyhow::Result<Arc<Self>> {
        let id = Uuid::new_v4().to_string();
        let mut name = session_label
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .unwrap_or_else(|| format!("Session {}", &id[..8]));
        if scenario.is_some() && !name.starts_with("M ") {
            name = format!("M {name}");
        }
        let session = SessionInfo { id: id.clone(), name: name.clone(), started_at: Utc::now() };

        let default_source = match scenario {
            Some(sc) => sc.source_tag(),
            None => SOURCE_REAL.to_string(),
        };
        let mode = match scenario {
            Some(sc) => format!("MOCK/{}", sc.source_tag().trim_start_matches("MOCK_")),
            None => "REAL".to_string(),
        };

        let journal = LocalJournal::open(&config.spool_dir, &id).context("opening session journal")?;
        let normalizer = Normalizer::new(
            id.clone(),
            name.clone(),
            default_source,
            OutlierDetector::default(),
            TelemetryCalculator::default(),
        );
        let generator = scenario.map(|sc| {
            Mutex::new(MockDataGenerator::new(
                MockModeConfig::from_scenario(sc),
                id.clone(),
                name.clone(),
                config.mock_interval.as_secs_f64(),
            ))
        });

        let publisher = RateLimitedPublisher::new(
            config.publish_rate_limit,
            config.publish_burst_capacity,
            config.publish_queue_max_size,
            config.publish_drain_interval,
        );
        let source = RedisSource::new(&config.redis_url, &config.source_channel);
        let sink = RedisSink::new(&config.redis_url, &config.dashboard_channel);
        let db = match &config.supabase_url {
            Some(url) => Some(DbClient::new(url, &config.supabase_api_key, &config.supabase_table)?),
            None => None,
        };

        let retry = RetryState {
            queue: VecDeque::new(),
            backoff: config.retry_base_backoff,
            next_retry_at: Instant::now(),
            write_failures: 0,
        };
        let (shutdown, _) = watch::channel(false);

        info!("🆔 new session: {id}");
        info!("📝 session name: {name}");
        info!("🎛 mode: {mode}");

        Ok(Arc::new(Self {
            config,
            session,
            mode,
            normalizer: Mutex::new(normalizer),
            journal: Mutex::new(journal),
            generator,
            source,
            sink,
            db,
            publisher,
            repub_queue: Mutex::new(VecDeque::new()),
            db_buffer: Mutex::new(Vec::new()),
            retry: AsyncMutex::new(retry),
            source_health: Mutex::new(ConnectionHealth::default()),
            sink_health: Mutex::new(ConnectionHealth::default()),
            source_reconnect_guard: AsyncMutex::new(()),
            sink_reconnect_guard: AsyncMutex::new(()),
            source_kick: Notify::new(),
            running: AtomicBool::new(false),
            shutdown,
            stats: BridgeStats::default(),
        }))
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    pub fn request_shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.shutdown.send_replace(true);
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        if self.db.is_none() {
            warn!("database credentials not configured; batches will queue and export as CSV on shutdown");
        }

        // The dashboard sink is required; the source only in real mode.
        self.sink
            .connect(self.config.connection_timeout)
            .await
            .context("dashboard channel connect failed")?;
        self.sink_health.lock().is_connected = true;

        if self.generator.is_none() {
            self.source
                .connect(self.config.connection_timeout)
                .await
                .context("source channel connect failed")?;
            self.source_health.lock().is_connected = true;
        }

        self.running.store(true, Ordering::Relaxed);
        info!(
            "🚀 bridge started (session: {} / {})",
            self.session.name,
            &self.session.id[..8]
        );

        let mut handles = Vec::new();
        handles.push(tokio::spawn(Self::republish_task(self.clone())));
        handles.push(tokio::spawn(Self::db_writer_task(self.clone())));
        handles.push(tokio::spawn(Self::health_task(self.clone())));
        handles.push(tokio::spawn(Self::stats_task(self.clone())));
        if self.generator.is_some() {
            handles.push(tokio::spawn(Self::mock_task(self.clone())));
        } else {
            handles.push(tokio::spawn(Self::ingest_task(self.clone())));
        }

        let signal_bridge = self.clone();
        let signal_handle = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("🛑 shutdown signal received");
                signal_bridge.request_shutdown();
            }
        });

        // Wait for the shutdown flag.
        let mut rx = self.shutdown.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }

        self.running.store(false, Ordering::Relaxed);
        signal_handle.abort();
        for mut handle in handles {
            if tokio::time::timeout(Duration::from_secs(5), &mut handle).await.is_err() {
                handle.abort();
            }
        }

        self.cleanup().await;
        Ok(())
    }

    async fn cleanup(&self) {
        info!("🧹 cleaning up");

        self.flush_db_buffer().await;

        let (pending_batches, failures) = {
            let retry = self.retry.lock().await;
            (retry.queue.len(), retry.write_failures)
        };
        if pending_batches > 0 || failures > 0 {
            let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
            let out = self
                .config
                .export_dir
                .join(format!("telemetry_{}_{stamp}.csv", self.session.id));
            match self.journal.lock().export_csv(&out, &CSV_FIELD_ORDER) {
                Ok(rows) => warn!(
                    "📤 exported session CSV with {rows} rows to {} ({pending_batches} batches unstored, {failures} write failures)",
                    out.display()
                ),
                Err(e) => error!("CSV export failed: {e:#}"),
            }
        }

        self.source.close().await;
        self.sink.close().await;
        self.journal.lock().flush();
        info!("✅ cleanup done");
    }

    // ── Ingest path ───────────────────────────────────────────────────────────

    async fn ingest_task(bridge: Arc<Self>) {
        let mut rx = bridge.shutdown.subscribe();
        while bridge.running.load(Ordering::Relaxed) {
            if !bridge.source_health.lock().is_connected {
                if !bridge.reconnect_source().await {
                    tokio::select! {
                        _ = rx.changed() => break,
                        _ = sleep(Duration::from_secs(1)) => {}
                    }
                }
                continue;
            }
            tokio::select! {
                _ = rx.changed() => break,
                _ = bridge.source_kick.notified() => continue,
                result = bridge.source.recv() => match result {
                    Ok(payload) => bridge.handle_payload(&payload),
                    Err(e) => {
                        bridge.count_error(format!("source receive failed: {e}"));
                        let mut health = bridge.source_health.lock();
                        health.record_error();
                        health.is_connected = false;
                    }
                }
            }
        }
    }

    async fn mock_task(bridge: Arc<Self>) {
        let mut rx = bridge.shutdown.subscribe();
        let mut ticker = tokio::time::interval(bridge.config.mock_interval);
        loop {
            tokio::select! {
                _ = rx.changed() => break,
                _ = ticker.tick() => {}
            }
            if !bridge.running.load(Ordering::Relaxed) {
                break;
            }
            let raw = match &bridge.generator {
                Some(generator) => generator.lock().generate(),
                None => return,
            };
            // A suppressed tick models a stall or a dropped message; the
            // interval simply elapses.
            if let Some(raw) = raw {
                bridge.process_raw(raw);
            }
        }
    }

    /// Parse, validate, normalize, journal, enqueue. Strictly sequential
    /// per sample; nothing here suspends.
    fn handle_payload(&self, payload: &[u8]) {
        let Some(mut raw) = parse_payload(payload) else {
            self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
            self.count_error("failed to parse incoming message".to_string());
            return;
        };
        let coerced = raw.sanitize();
        if coerced > 0 {
            warn!("⚠️ coerced {coerced} non-finite values to 0");
        }
        if !raw.has_core_field() {
            self.stats.validation_errors.fetch_add(1, Ordering::Relaxed);
            self.count_error("message validation failed (no core fields)".to_string());
            return;
        }
        self.process_raw(raw);
        self.source_health.lock().record_message();
    }

    fn process_raw(&self, raw: RawSample) {
        let sample = self.normalizer.lock().normalize(raw);

        // 1) durable journal
        self.journal.lock().append(&sample);

        // 2) realtime republish queue, drop-oldest on overflow
        {
            let mut queue = self.repub_queue.lock();
            if queue.len() >= self.config.max_queue_size {
                queue.pop_front();
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(sample.clone());
        }

        // 3) database buffer
        self.db_buffer.lock().push(sample);

        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    // ── Republish path ────────────────────────────────────────────────────────

    async fn republish_task(bridge: Arc<Self>) {
        let mut rx = bridge.shutdown.subscribe();
        while bridge.running.load(Ordering::Relaxed) {
            if !bridge.sink_health.lock().is_connected {
                if bridge.reconnect_sink().await {
                    let drained = bridge.publisher.drain(&bridge.sink).await;
                    if drained > 0 {
                        info!("🔄 drained {drained} queued dashboard messages");
                    }
                } else {
                    tokio::select! {
                        _ = rx.changed() => break,
                        _ = sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            }

            // Overflow first, then fresh messages.
            bridge.publisher.drain(&bridge.sink).await;

            let mut batch: VecDeque<TelemetrySample> = {
                let mut queue = bridge.repub_queue.lock();
                let take = queue.len().min(20);
                queue.drain(..take).collect()
            };

            while let Some(sample) = batch.pop_front() {
                match bridge.publisher.publish(&bridge.sink, sample).await {
                    PublishOutcome::Published => {
                        bridge.stats.messages_republished.fetch_add(1, Ordering::Relaxed);
                        bridge.sink_health.lock().record_message();
                    }
                    PublishOutcome::Queued => {}
                    PublishOutcome::Dropped => {
                        bridge.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    PublishOutcome::QueuedAfterError => {
                        bridge.count_error("dashboard publish failed; sink marked disconnected".to_string());
                        {
                            let mut health = bridge.sink_health.lock();
                            health.record_error();
                            health.is_connected = false;
                        }
                        // The unsent remainder goes back to the queue head.
                        let mut queue = bridge.repub_queue.lock();
                        while let Some(s) = batch.pop_back() {
                            queue.push_front(s);
                        }
                        break;
                    }
                }
            }

            tokio::select! {
                _ = rx.changed() => break,
                _ = sleep(Duration::from_millis(50)) => {}
            }
        }
    }

    // ── Database path ─────────────────────────────────────────────────────────

    async fn db_writer_task(bridge: Arc<Self>) {
        let mut rx = bridge.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = rx.changed() => break,
                _ = sleep(bridge.config.db_batch_interval) => {}
            }
            if !bridge.running.load(Ordering::Relaxed) {
                break;
            }
            bridge.retry_failed_batches().await;
            bridge.flush_db_buffer().await;
        }
    }

    async fn retry_failed_batches(&self) {
        let batches: Vec<Vec<TelemetrySample>> = {
            let mut retry = self.retry.lock().await;
            if retry.queue.is_empty() || Instant::now() < retry.next_retry_at {
                return;
            }
            retry.queue.drain(..).collect()
        };
        let count = batches.len();
        let failed = self.write_batches(batches).await;

        let mut retry = self.retry.lock().await;
        if failed.is_empty() {
            info!("✅ retried {count} queued batches successfully");
            retry.backoff = self.config.retry_base_backoff;
        } else {
            retry.backoff = (retry.backoff * 2).min(self.config.retry_backoff_max);
            retry.write_failures += failed.len() as u64;
            for batch in failed {
                Self::push_retry(&mut retry, batch, self.config.retry_queue_cap);
            }
        }
        retry.next_retry_at = Instant::now() + retry.backoff;
    }

    async fn flush_db_buffer(&self) {
        let pending: Vec<TelemetrySample> = std::mem::take(&mut *self.db_buffer.lock());
        if pending.is_empty() {
            return;
        }
        let chunks: Vec<Vec<TelemetrySample>> = pending
            .chunks(self.config.max_batch_size)
            .map(|c| c.to_vec())
            .collect();

        let failed = self.write_batches(chunks).await;
        if !failed.is_empty() {
            let mut retry = self.retry.lock().await;
            retry.write_failures += failed.len() as u64;
            for batch in failed {
                Self::push_retry(&mut retry, batch, self.config.retry_queue_cap);
            }
            let backoff = retry.backoff;
            retry.next_retry_at = Instant::now() + backoff;
        }
    }

    /// Attempt every batch; returns the ones that failed.
    async fn write_batches(
        &self,
        batches: Vec<Vec<TelemetrySample>>,
    ) -> Vec<Vec<TelemetrySample>> {
        let Some(db) = &self.db else {
            return batches;
        };
        let mut failed = Vec::new();
        for batch in batches {
            match db.insert_batch(&batch).await {
                Ok(stored) => {
                    self.stats
                        .messages_stored_db
                        .fetch_add(stored as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    self.count_error(format!("database write failed ({} records): {e:#}", batch.len()));
                    failed.push(batch);
                }
            }
        }
        failed
    }

    fn push_retry(retry: &mut RetryState, batch: Vec<TelemetrySample>, cap: usize) {
        if retry.queue.len() >= cap {
            retry.queue.pop_front();
            warn!("retry queue at capacity; shed oldest batch (journal still covers it)");
        }
        retry.queue.push_back(batch);
    }

    // ── Supervision ───────────────────────────────────────────────────────────

    async fn health_task(bridge: Arc<Self>) {
        let mut rx = bridge.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = rx.changed() => break,
                _ = sleep(bridge.config.health_check_interval) => {}
            }
            if !bridge.running.load(Ordering::Relaxed) {
                break;
            }

            if bridge.generator.is_none() {
                let stale = bridge
                    .source_health
                    .lock()
                    .is_stale(bridge.config.watchdog_timeout);
                if stale {
                    warn!(
                        "⚠️ source silent for over {:.0}s; forcing reconnect",
                        bridge.config.watchdog_timeout.as_secs_f64()
                    );
                    bridge.source_health.lock().is_connected = false;
                    bridge.source_kick.notify_one();
                } else if !bridge.source.is_connected() {
                    bridge.source_health.lock().is_connected = false;
                    bridge.source_kick.notify_one();
                }
            }
            if !bridge.sink.is_connected() {
                bridge.sink_health.lock().is_connected = false;
            }
        }
    }

    async fn reconnect_source(&self) -> bool {
        let Ok(_guard) = self.source_reconnect_guard.try_lock() else {
            return false;
        };
        let attempts = {
            let mut health = self.source_health.lock();
            if health.reconnect_attempts >= self.config.reconnect_max_attempts {
                error!(
                    "❌ source reconnect attempts exhausted ({})",
                    self.config.reconnect_max_attempts
                );
                return false;
            }
            let n = health.reconnect_attempts;
            health.reset_for_reconnect();
            n
        };
        let delay = reconnect_delay(
            attempts,
            self.config.reconnect_base_delay,
            self.config.retry_backoff_max,
        );
        warn!(
            "🔄 reconnecting source (attempt {}) in {:.1}s",
            attempts + 1,
            delay.as_secs_f64()
        );
        sleep(delay).await;

        match self.source.connect(self.config.connection_timeout).await {
            Ok(()) => {
                self.source_health.lock().on_connected();
                info!("✅ source reconnected");
                true
            }
            Err(e) => {
                self.count_error(format!("source reconnect failed: {e}"));
                self.source_health.lock().record_error();
                false
            }
        }
    }

    async fn reconnect_sink(&self) -> bool {
        let Ok(_guard) = self.sink_reconnect_guard.try_lock() else {
            return false;
        };
        let attempts = {
            let mut health = self.sink_health.lock();
            if health.reconnect_attempts >= self.config.reconnect_max_attempts {
                error!(
                    "❌ dashboard reconnect attempts exhausted ({})",
                    self.config.reconnect_max_attempts
                );
                return false;
            }
            let n = health.reconnect_attempts;
            health.reset_for_reconnect();
            n
        };
        let delay = reconnect_delay(
            attempts,
            self.config.reconnect_base_delay,
            self.config.retry_backoff_max,
        );
        warn!(
            "🔄 reconnecting dashboard (attempt {}) in {:.1}s",
            attempts + 1,
            delay.as_secs_f64()
        );
        sleep(delay).await;

        match self.sink.connect(self.config.connection_timeout).await {
            Ok(()) => {
                self.sink_health.lock().on_connected();
                info!("✅ dashboard reconnected");
                true
            }
            Err(e) => {
                self.count_error(format!("dashboard reconnect failed: {e}"));
                self.sink_health.lock().record_error();
                false
            }
        }
    }

    // ── Stats ─────────────────────────────────────────────────────────────────

    async fn stats_task(bridge: Arc<Self>) {
        let mut rx = bridge.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = rx.changed() => break,
                _ = sleep(bridge.config.stats_interval) => {}
            }
            if !bridge.running.load(Ordering::Relaxed) {
                break;
            }

            let stats = &bridge.stats;
            let buffer_len = bridge.db_buffer.lock().len();
            let (retry_batches, write_failures) = {
                let retry = bridge.retry.lock().await;
                (retry.queue.len(), retry.write_failures)
            };
            let reconnects = bridge.source_health.lock().total_reconnects
                + bridge.sink_health.lock().total_reconnects;
            let publisher = bridge.publisher.snapshot();
            let (outliers, detection_ms) = {
                let normalizer = bridge.normalizer.lock();
                (
                    normalizer.outliers_detected(),
                    normalizer.detector_stats().avg_detection_ms,
                )
            };

            info!(
                "📊 STATS ({}) — received: {}, republished: {}, db stored: {}, dropped: {}, buffer: {buffer_len}, retry batches: {retry_batches}, write failures: {write_failures}, reconnects: {reconnects}, errors: {}",
                bridge.mode,
                stats.messages_received.load(Ordering::Relaxed),
                stats.messages_republished.load(Ordering::Relaxed),
                stats.messages_stored_db.load(Ordering::Relaxed),
                stats.messages_dropped.load(Ordering::Relaxed),
                stats.errors.load(Ordering::Relaxed),
            );
            info!(
                "   📈 rate limiter: depth={}, bursts={}, delayed={} | outliers: {outliers} flagged, {detection_ms:.2}ms avg detection",
                publisher.queue_depth, publisher.burst_events, publisher.delayed,
            );
            if let Some(last) = bridge.stats.last_error.lock().clone() {
                info!("🔍 last error: {last}");
            }
        }
    }

    fn count_error(&self, message: String) {
        error!("❌ {message}");
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        *self.stats.last_error.lock() = Some(message);
    }
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// JSON first; the fixed binary frame as a fallback when the length matches.
fn parse_payload(payload: &[u8]) -> Option<RawSample> {
    if let Ok(raw) = serde_json::from_slice::<RawSample>(payload) {
        return Some(raw);
    }
    decode_wire_frame(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_prefers_json() {
        let raw = parse_payload(br#"{"speed_ms": 3.5, "voltage_v": 47.0}"#).unwrap();
        assert_eq!(raw.speed_ms, Some(3.5));
    }

    #[test]
    fn parse_falls_back_to_binary_frame() {
        let mut buf = Vec::new();
        for v in [10.0f32, 48.0, 5.0, 40.0, -74.0, 100.0] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf.extend_from_slice(&7u32.to_le_bytes());
        let raw = parse_payload(&buf).unwrap();
        assert_eq!(raw.message_id, Some(7));
        assert!((raw.power_w.unwrap() - 240.0).abs() < 1e-3);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_payload(b"hello world").is_none());
        assert!(parse_payload(&[1, 2, 3]).is_none());
    }

    #[test]
    fn parse_rejects_non_object_json() {
        assert!(parse_payload(b"42").is_none());
        assert!(parse_payload(b"\"str\"").is_none());
    }
}
