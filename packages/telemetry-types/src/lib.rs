//! # telemetry-types
//!
//! Shared sample structures for the telemetry bridge.
//!
//! These types are used by:
//! - `telemetry-bridge`: parsing incoming vehicle messages, journaling,
//!   republishing to the dashboard channel and batching to the database
//! - `telemetry-analytics`: outlier detection and derived-metric calculation
//! - `telemetry-mock`: synthetic sample generation
//!
//! ## Shapes
//!
//! - [`RawSample`] is the loose shape at the parse seam: every field optional,
//!   unknown keys ignored. Anything that reaches the pipeline beyond the seam
//!   is a [`TelemetrySample`] with all default fields filled.
//! - [`DerivedMetrics`] is flattened into the sample on serialization, so the
//!   dashboard message and the journal line carry one flat JSON object.
//!
//! ## Units
//!
//! SI at the boundary: m/s, volts, amps, watts, joules, meters, deg/s, m/s².
//! Driver inputs exist in both 0..1 and percent form and are kept in sync by
//! the normalizer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ── Provenance ────────────────────────────────────────────────────────────────

/// `data_source` value for samples arriving from the live vehicle link.
pub const SOURCE_REAL: &str = "ESP32_REAL";

/// Event name used when republishing samples to the dashboard channel.
pub const TELEMETRY_EVENT: &str = "telemetry_update";

// ── Outlier report ────────────────────────────────────────────────────────────

/// Reason code attached to a single flagged field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutlierReason {
    AbsoluteBound,
    ZScoreExceeded,
    SuddenJump,
    MagnitudeExceeded,
    RateOfChange,
    GpsSpeedMismatch,
    ImpossibleSpeed,
    AltitudeRate,
    NegativeValue,
    NonMonotonic,
    ImplausibleIncrease,
    StuckSensor,
}

/// Whole-sample severity label. Exactly one is assigned per flagged sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutlierSeverity {
    Info,
    Warning,
    Critical,
}

/// Per-sample outlier verdict produced by the detector.
/// Absent from the sample entirely when nothing was flagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierReport {
    pub flagged_fields: Vec<String>,
    /// Per-field confidence in \[0, 1\].
    pub confidence: BTreeMap<String, f64>,
    pub reasons: BTreeMap<String, OutlierReason>,
    pub severity: OutlierSeverity,
}

impl OutlierReport {
    pub fn is_flagged(&self, field: &str) -> bool {
        self.flagged_fields.iter().any(|f| f == field)
    }
}

// ── Derived metrics ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionState {
    #[default]
    Stationary,
    Turning,
    Braking,
    Accelerating,
    Cruising,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverMode {
    Braking,
    Coasting,
    #[default]
    Eco,
    Normal,
    Aggressive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PedalIntensity {
    #[default]
    Idle,
    Light,
    Moderate,
    Heavy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeakSeverity {
    Low,
    Medium,
    High,
}

/// One recorded current or acceleration peak.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakEvent {
    pub timestamp: String,
    pub value: f64,
    pub threshold: f64,
    pub motion_state: MotionState,
    pub accel_magnitude: f64,
    pub severity: PeakSeverity,
}

/// Additive metrics computed by the calculator for every sample.
/// Flattened into [`TelemetrySample`] so the dashboard payload stays flat.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivedMetrics {
    /// Rolling integrated efficiency, km/kWh. Suppressed outside (0, 500).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub efficiency_km_kwh: Option<f64>,

    // Session extremes
    pub max_speed_kmh: f64,
    pub max_power_w: f64,
    pub max_current_a: f64,
    pub max_g_force: f64,

    // Rolling averages (last 50 samples)
    pub avg_speed_ms: f64,
    pub avg_voltage_v: f64,
    pub avg_current_a: f64,
    pub avg_power_w: f64,
    pub avg_acceleration: f64,

    pub cumulative_energy_kwh: f64,

    /// Speed bucket (e.g. "10-15 m/s") with the best integrated efficiency.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimal_speed_range: Option<String>,
    /// Regression-estimated efficiency-optimal cruising speed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimal_speed_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimal_speed_confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimal_efficiency_km_kwh: Option<f64>,

    pub motion_state: MotionState,
    pub driver_mode: DriverMode,
    pub throttle_intensity: PedalIntensity,
    pub brake_intensity: PedalIntensity,

    /// Gravity-compensated acceleration magnitude, m/s².
    pub accel_magnitude: f64,
    pub g_force: f64,

    /// Most recent current peaks (capped at 10 on the wire).
    pub current_peaks: Vec<PeakEvent>,
    pub current_peak_count: u64,
    pub accel_peaks: Vec<PeakEvent>,
    pub accel_peak_count: u64,

    /// Haversine-integrated GPS track distance, meters.
    pub gps_distance_m: f64,
    pub elevation_gain_m: f64,
}

// ── Canonical sample ──────────────────────────────────────────────────────────

/// The canonical telemetry record. Every field is present after
/// normalization; missing inputs default to zero.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySample {
    pub session_id: String,
    pub session_name: String,
    /// UTC ISO-8601 instant.
    pub timestamp: String,

    pub speed_ms: f64,
    pub voltage_v: f64,
    pub current_a: f64,
    pub power_w: f64,
    /// Monotonically non-decreasing within a session.
    pub energy_j: f64,
    /// Monotonically non-decreasing within a session.
    pub distance_m: f64,

    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,

    pub gyro_x: f64,
    pub gyro_y: f64,
    pub gyro_z: f64,
    pub accel_x: f64,
    pub accel_y: f64,
    pub accel_z: f64,
    /// √(ax² + ay² + az²), recomputed by the normalizer when zero.
    pub total_acceleration: f64,

    pub message_id: u64,
    pub uptime_seconds: f64,

    /// Driver inputs: percent form (0..100) and unit form (0..1), mutually
    /// consistent after normalization.
    pub throttle_pct: f64,
    pub brake_pct: f64,
    pub throttle: f64,
    pub brake: f64,

    pub data_source: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub outliers: Option<OutlierReport>,

    #[serde(flatten)]
    pub derived: DerivedMetrics,
}

// ── Parse seam ────────────────────────────────────────────────────────────────

/// Loose incoming shape: any JSON object with a subset of the sample fields.
/// This is the only place the free-form wire shape exists; everything past
/// the parse seam is a [`TelemetrySample`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawSample {
    pub session_id: Option<String>,
    pub session_name: Option<String>,
    pub timestamp: Option<String>,
    pub speed_ms: Option<f64>,
    pub voltage_v: Option<f64>,
    pub current_a: Option<f64>,
    pub power_w: Option<f64>,
    pub energy_j: Option<f64>,
    pub distance_m: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub gyro_x: Option<f64>,
    pub gyro_y: Option<f64>,
    pub gyro_z: Option<f64>,
    pub accel_x: Option<f64>,
    pub accel_y: Option<f64>,
    pub accel_z: Option<f64>,
    pub total_acceleration: Option<f64>,
    pub message_id: Option<u64>,
    pub uptime_seconds: Option<f64>,
    pub throttle_pct: Option<f64>,
    pub brake_pct: Option<f64>,
    pub throttle: Option<f64>,
    pub brake: Option<f64>,
    pub data_source: Option<String>,
}

impl RawSample {
    /// A message must carry at least one core measurement to be worth keeping.
    pub fn has_core_field(&self) -> bool {
        self.speed_ms.is_some() || self.voltage_v.is_some() || self.current_a.is_some()
    }

    /// Replace NaN/∞ values with 0.0. Returns how many fields were coerced.
    pub fn sanitize(&mut self) -> usize {
        let mut fixed = 0usize;
        let mut fix = |v: &mut Option<f64>| {
            if let Some(x) = v {
                if !x.is_finite() {
                    *x = 0.0;
                    fixed += 1;
                }
            }
        };
        fix(&mut self.speed_ms);
        fix(&mut self.voltage_v);
        fix(&mut self.current_a);
        fix(&mut self.power_w);
        fix(&mut self.energy_j);
        fix(&mut self.distance_m);
        fix(&mut self.latitude);
        fix(&mut self.longitude);
        fix(&mut self.altitude);
        fix(&mut self.gyro_x);
        fix(&mut self.gyro_y);
        fix(&mut self.gyro_z);
        fix(&mut self.accel_x);
        fix(&mut self.accel_y);
        fix(&mut self.accel_z);
        fix(&mut self.total_acceleration);
        fix(&mut self.uptime_seconds);
        fix(&mut self.throttle_pct);
        fix(&mut self.brake_pct);
        fix(&mut self.throttle);
        fix(&mut self.brake);
        fixed
    }
}

// ── Binary wire frame ─────────────────────────────────────────────────────────

/// Fixed-layout fallback frame emitted by the vehicle firmware:
/// little-endian `f32 × 6` (speed, voltage, current, lat, lon, alt)
/// followed by a `u32` message counter.
pub const WIRE_FRAME_LEN: usize = 28;

/// Decode the 28-byte binary frame. `power_w` is derived on decode.
/// Returns `None` unless the payload length matches exactly.
pub fn decode_wire_frame(payload: &[u8]) -> Option<RawSample> {
    if payload.len() != WIRE_FRAME_LEN {
        return None;
    }
    let f = |i: usize| -> f64 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&payload[i * 4..i * 4 + 4]);
        f32::from_le_bytes(b) as f64
    };
    let voltage = f(1);
    let current = f(2);
    let mut id = [0u8; 4];
    id.copy_from_slice(&payload[24..28]);

    Some(RawSample {
        speed_ms: Some(f(0)),
        voltage_v: Some(voltage),
        current_a: Some(current),
        latitude: Some(f(3)),
        longitude: Some(f(4)),
        altitude: Some(f(5)),
        power_w: Some(voltage * current),
        message_id: Some(u32::from_le_bytes(id) as u64),
        ..RawSample::default()
    })
}

// ── CSV export order ──────────────────────────────────────────────────────────

/// Canonical column order for session CSV exports.
pub const CSV_FIELD_ORDER: [&str; 26] = [
    "session_id",
    "session_name",
    "timestamp",
    "speed_ms",
    "voltage_v",
    "current_a",
    "power_w",
    "energy_j",
    "distance_m",
    "latitude",
    "longitude",
    "altitude",
    "gyro_x",
    "gyro_y",
    "gyro_z",
    "accel_x",
    "accel_y",
    "accel_z",
    "total_acceleration",
    "message_id",
    "uptime_seconds",
    "throttle_pct",
    "brake_pct",
    "throttle",
    "brake",
    "data_source",
];

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_frame_roundtrip() {
        let mut buf = Vec::with_capacity(WIRE_FRAME_LEN);
        for v in [12.5f32, 48.0, 6.5, 40.7128, -74.0060, 101.5] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf.extend_from_slice(&1234u32.to_le_bytes());

        let raw = decode_wire_frame(&buf).expect("frame should decode");
        assert_eq!(raw.message_id, Some(1234));
        assert!((raw.speed_ms.unwrap() - 12.5).abs() < 1e-6);
        assert!((raw.power_w.unwrap() - 48.0 * 6.5).abs() < 1e-3);
        assert!(raw.energy_j.is_none());
    }

    #[test]
    fn wire_frame_rejects_bad_length() {
        assert!(decode_wire_frame(&[0u8; 27]).is_none());
        assert!(decode_wire_frame(&[0u8; 29]).is_none());
        assert!(decode_wire_frame(&[]).is_none());
    }

    #[test]
    fn raw_sample_parses_partial_json() {
        let raw: RawSample =
            serde_json::from_str(r#"{"speed_ms": 10.0, "unknown_key": true}"#).unwrap();
        assert!(raw.has_core_field());
        assert_eq!(raw.speed_ms, Some(10.0));
        assert!(raw.voltage_v.is_none());

        let empty: RawSample = serde_json::from_str(r#"{"note": "hi"}"#).unwrap();
        assert!(!empty.has_core_field());
    }

    #[test]
    fn sanitize_replaces_non_finite() {
        let mut raw = RawSample {
            speed_ms: Some(f64::NAN),
            voltage_v: Some(f64::INFINITY),
            current_a: Some(5.0),
            ..RawSample::default()
        };
        assert_eq!(raw.sanitize(), 2);
        assert_eq!(raw.speed_ms, Some(0.0));
        assert_eq!(raw.voltage_v, Some(0.0));
        assert_eq!(raw.current_a, Some(5.0));
    }

    #[test]
    fn sample_serializes_flat() {
        let mut sample = TelemetrySample {
            session_id: "s".into(),
            speed_ms: 12.0,
            ..TelemetrySample::default()
        };
        sample.derived.avg_speed_ms = 11.0;

        let v: serde_json::Value = serde_json::to_value(&sample).unwrap();
        // Derived metrics flatten into the top-level object.
        assert_eq!(v["avg_speed_ms"], 11.0);
        assert!(v.get("derived").is_none());
        // No outliers → key absent entirely.
        assert!(v.get("outliers").is_none());
    }
}
