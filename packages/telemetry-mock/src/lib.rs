//! # telemetry-mock
//!
//! Synthetic vehicle telemetry with injectable fault scenarios.
//!
//! The generator produces the same shape the live source produces
//! ([`telemetry_types::RawSample`]) so it feeds the identical enrichment
//! pipeline, which is what makes the outlier detectors validatable: every
//! fault class below maps onto a detector check.
//!
//! Each scenario is recoverable — faults are windows or one-shot events,
//! never permanent state corruption.

mod generator;
mod scenario;

pub use generator::{GeneratorStats, MockDataGenerator};
pub use scenario::{MockModeConfig, MockScenario};
