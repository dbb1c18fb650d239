//! # telemetry-analytics
//!
//! The in-flight enrichment pipeline: rolling statistics, per-sample outlier
//! detection, derived-metric calculation and canonical-sample normalization.
//!
//! Data flow per sample:
//!
//! ```text
//! RawSample ── Normalizer ──► TelemetrySample
//!                 │                (defaults filled, timestamps repaired,
//!                 ├─ OutlierDetector   driver inputs reconciled)
//!                 └─ TelemetryCalculator (hosts OptimalSpeedOptimizer)
//! ```
//!
//! Detector and calculator state is mutated only on this path; nothing else
//! reads it concurrently.

pub mod calculator;
pub mod detector;
pub mod normalizer;
pub mod optimizer;
pub mod window;

pub use calculator::{CalculatorConfig, TelemetryCalculator};
pub use detector::{DetectorStats, OutlierConfig, OutlierDetector};
pub use normalizer::Normalizer;
pub use optimizer::{OptimalSpeedEstimate, OptimalSpeedOptimizer, OptimizerConfig};
pub use window::{GpsPoint, GpsTrackWindow, RollingWindow};
