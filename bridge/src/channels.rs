//! Realtime channel seam.
//!
//! The bridge talks to its messaging transport through this module only:
//! [`RedisSource`] subscribes to the vehicle channel and yields raw payloads,
//! [`RedisSink`] publishes enriched samples to the dashboard channel. The
//! [`PublishSink`] trait is the narrow surface the rate-limited publisher
//! needs, so tests can substitute an in-memory sink.
//!
//! Transport errors never panic; they mark the channel disconnected and flow
//! back to the supervisor, which owns reconnect policy.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use telemetry_types::TelemetrySample;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("transport error: {0}")]
    Transport(#[from] redis::RedisError),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

// ── Publish seam ──────────────────────────────────────────────────────────────

/// Anything the rate-limited publisher can push samples into.
pub trait PublishSink: Send + Sync {
    fn publish(
        &self,
        event: &str,
        sample: &TelemetrySample,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;
}

// ── Source channel ────────────────────────────────────────────────────────────

/// Subscription to the vehicle telemetry channel.
pub struct RedisSource {
    url: String,
    channel: String,
    pubsub: Mutex<Option<redis::aio::PubSub>>,
    connected: AtomicBool,
}

impl RedisSource {
    pub fn new(url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            channel: channel.into(),
            pubsub: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub async fn connect(&self, timeout: Duration) -> Result<(), ChannelError> {
        let client = redis::Client::open(self.url.as_str())?;
        let mut pubsub = tokio::time::timeout(timeout, client.get_async_pubsub())
            .await
            .map_err(|_| ChannelError::ConnectTimeout(timeout))??;
        tokio::time::timeout(timeout, pubsub.subscribe(&self.channel))
            .await
            .map_err(|_| ChannelError::ConnectTimeout(timeout))??;

        *self.pubsub.lock().await = Some(pubsub);
        self.connected.store(true, Ordering::Relaxed);
        info!("subscribed to source channel '{}'", self.channel);
        Ok(())
    }

    /// Wait for the next message payload. An ended subscription stream is
    /// reported as [`ChannelError::NotConnected`] and drops the connection.
    pub async fn recv(&self) -> Result<Vec<u8>, ChannelError> {
        let mut guard = self.pubsub.lock().await;
        let message = {
            let Some(pubsub) = guard.as_mut() else {
                return Err(ChannelError::NotConnected);
            };
            pubsub.on_message().next().await
        };
        match message {
            Some(msg) => {
                debug!("source message ({} bytes)", msg.get_payload_bytes().len());
                Ok(msg.get_payload_bytes().to_vec())
            }
            None => {
                *guard = None;
                self.connected.store(false, Ordering::Relaxed);
                Err(ChannelError::NotConnected)
            }
        }
    }

    /// Whether the transport itself still looks connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub async fn close(&self) {
        *self.pubsub.lock().await = None;
        self.connected.store(false, Ordering::Relaxed);
    }
}

// ── Sink channel ──────────────────────────────────────────────────────────────

/// Publisher handle for the dashboard channel. Samples travel as a JSON
/// envelope `{"event": ..., "data": ...}`.
pub struct RedisSink {
    url: String,
    channel: String,
    conn: Mutex<Option<redis::aio::MultiplexedConnection>>,
    connected: AtomicBool,
}

impl RedisSink {
    pub fn new(url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            channel: channel.into(),
            conn: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub async fn connect(&self, timeout: Duration) -> Result<(), ChannelError> {
        let client = redis::Client::open(self.url.as_str())?;
        let conn = tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| ChannelError::ConnectTimeout(timeout))??;

        *self.conn.lock().await = Some(conn);
        self.connected.store(true, Ordering::Relaxed);
        info!("connected to dashboard channel '{}'", self.channel);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub async fn close(&self) {
        *self.conn.lock().await = None;
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl PublishSink for RedisSink {
    async fn publish(&self, event: &str, sample: &TelemetrySample) -> Result<(), ChannelError> {
        let envelope = serde_json::json!({ "event": event, "data": sample });
        let payload = serde_json::to_string(&envelope)?;

        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return Err(ChannelError::NotConnected);
        };
        match conn.publish::<_, _, ()>(&self.channel, payload).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // A failed publish poisons the handle; the supervisor will
                // reconnect with backoff.
                *guard = None;
                self.connected.store(false, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }
}
