//! # telemetry-bridge
//!
//! Ingests a high-frequency stream of vehicle sensor samples from a realtime
//! channel (or the synthetic generator), enriches each sample in-flight,
//! republishes it to the dashboard channel under a strict rate cap, journals
//! everything to local append-only storage, and flushes batches to the
//! database with bounded retry. On shutdown with any unstored residue the
//! journal is exported as CSV so no data is lost.

pub mod bridge;
pub mod channels;
pub mod config;
pub mod db;
pub mod health;
pub mod journal;
pub mod publisher;

pub use bridge::Bridge;
pub use config::BridgeConfig;
