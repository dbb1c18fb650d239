//! Canonical sample production.
//!
//! The normalizer turns a loose [`RawSample`] into a fully-populated
//! [`TelemetrySample`]: session identity stamped, timestamp repaired to UTC
//! ISO-8601, defaults filled, derived electrical/IMU aggregates recomputed
//! when absent, driver inputs reconciled between their percent and unit
//! forms, and the detector + calculator outputs attached. A panic inside
//! either enrichment stage is isolated per sample so a single malformed
//! record can never halt the pipeline.

use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use tracing::warn;

use telemetry_types::{DerivedMetrics, OutlierReport, RawSample, TelemetrySample};

use crate::calculator::TelemetryCalculator;
use crate::detector::{DetectorStats, OutlierDetector};

pub struct Normalizer {
    session_id: String,
    session_name: String,
    default_source: String,
    detector: OutlierDetector,
    calculator: TelemetryCalculator,
    outliers_detected: u64,
}

impl Normalizer {
    pub fn new(
        session_id: impl Into<String>,
        session_name: impl Into<String>,
        default_source: impl Into<String>,
        detector: OutlierDetector,
        calculator: TelemetryCalculator,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            session_name: session_name.into(),
            default_source: default_source.into(),
            detector,
            calculator,
            outliers_detected: 0,
        }
    }

    /// Produce the canonical sample. Infallible: enrichment failures degrade
    /// to `outliers = None` / default derived metrics rather than erroring.
    pub fn normalize(&mut self, raw: RawSample) -> TelemetrySample {
        let mut sample = TelemetrySample {
            session_id: self.session_id.clone(),
            session_name: self.session_name.clone(),
            timestamp: repair_timestamp(raw.timestamp.as_deref()),
            speed_ms: raw.speed_ms.unwrap_or(0.0),
            voltage_v: raw.voltage_v.unwrap_or(0.0),
            current_a: raw.current_a.unwrap_or(0.0),
            power_w: raw.power_w.unwrap_or(0.0),
            energy_j: raw.energy_j.unwrap_or(0.0),
            distance_m: raw.distance_m.unwrap_or(0.0),
            latitude: raw.latitude.unwrap_or(0.0),
            longitude: raw.longitude.unwrap_or(0.0),
            altitude: raw.altitude.unwrap_or(0.0),
            gyro_x: raw.gyro_x.unwrap_or(0.0),
            gyro_y: raw.gyro_y.unwrap_or(0.0),
            gyro_z: raw.gyro_z.unwrap_or(0.0),
            accel_x: raw.accel_x.unwrap_or(0.0),
            accel_y: raw.accel_y.unwrap_or(0.0),
            accel_z: raw.accel_z.unwrap_or(0.0),
            total_acceleration: raw.total_acceleration.unwrap_or(0.0),
            message_id: raw.message_id.unwrap_or(0),
            uptime_seconds: raw.uptime_seconds.unwrap_or(0.0),
            throttle_pct: raw.throttle_pct.unwrap_or(0.0),
            brake_pct: raw.brake_pct.unwrap_or(0.0),
            throttle: raw.throttle.unwrap_or(0.0),
            brake: raw.brake.unwrap_or(0.0),
            data_source: raw.data_source.unwrap_or_else(|| self.default_source.clone()),
            outliers: None,
            derived: DerivedMetrics::default(),
        };

        if sample.power_w == 0.0 {
            sample.power_w = sample.voltage_v * sample.current_a;
        }
        if sample.total_acceleration == 0.0 {
            sample.total_acceleration = (sample.accel_x.powi(2)
                + sample.accel_y.powi(2)
                + sample.accel_z.powi(2))
            .sqrt();
        }

        reconcile_driver_inputs(&mut sample);

        sample.outliers = self.detect_guarded(&sample);
        if sample.outliers.is_some() {
            self.outliers_detected += 1;
        }
        sample.derived = self.calculate_guarded(&sample);

        sample
    }

    pub fn outliers_detected(&self) -> u64 {
        self.outliers_detected
    }

    pub fn detector_stats(&self) -> DetectorStats {
        self.detector.stats()
    }

    /// Clear all per-session enrichment state.
    pub fn reset(&mut self) {
        self.detector.reset();
        self.calculator.reset();
        self.outliers_detected = 0;
    }

    fn detect_guarded(&mut self, sample: &TelemetrySample) -> Option<OutlierReport> {
        let detector = &mut self.detector;
        match panic::catch_unwind(AssertUnwindSafe(|| detector.detect(sample))) {
            Ok(report) => report,
            Err(_) => {
                warn!(message_id = sample.message_id, "outlier detection failed; sample continues unflagged");
                None
            }
        }
    }

    fn calculate_guarded(&mut self, sample: &TelemetrySample) -> DerivedMetrics {
        let calculator = &mut self.calculator;
        match panic::catch_unwind(AssertUnwindSafe(|| calculator.update(sample))) {
            Ok(metrics) => metrics,
            Err(_) => {
                warn!(message_id = sample.message_id, "metric calculation failed; derived fields defaulted");
                DerivedMetrics::default()
            }
        }
    }
}

// ── Timestamp repair ──────────────────────────────────────────────────────────

/// Coerce to a UTC RFC 3339 string. Epoch-zero stamps and anything that does
/// not parse are replaced with the current instant. Naive stamps are taken
/// as UTC.
fn repair_timestamp(ts: Option<&str>) -> String {
    let now = || Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    let Some(ts) = ts else {
        return now();
    };
    if ts.starts_with("1970-01-01") {
        return now();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return dt
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::Micros, true);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f") {
        return naive
            .and_utc()
            .to_rfc3339_opts(SecondsFormat::Micros, true);
    }
    now()
}

// ── Driver-input reconciliation ───────────────────────────────────────────────

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Fill whichever representation is zero from the other, clamped to the
/// legal range. A pair that is zero on both sides stays zero.
fn reconcile_driver_inputs(s: &mut TelemetrySample) {
    if s.throttle_pct == 0.0 && s.throttle != 0.0 {
        s.throttle_pct = clamp01(s.throttle) * 100.0;
    }
    if s.brake_pct == 0.0 && s.brake != 0.0 {
        s.brake_pct = clamp01(s.brake) * 100.0;
    }
    if s.throttle == 0.0 && s.throttle_pct != 0.0 {
        s.throttle = clamp01(s.throttle_pct / 100.0);
    }
    if s.brake == 0.0 && s.brake_pct != 0.0 {
        s.brake = clamp01(s.brake_pct / 100.0);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use telemetry_types::{OutlierReason, OutlierSeverity, SOURCE_REAL};

    fn normalizer() -> Normalizer {
        Normalizer::new(
            "test-session",
            "Test Session",
            SOURCE_REAL,
            OutlierDetector::default(),
            TelemetryCalculator::default(),
        )
    }

    #[test]
    fn fills_defaults_and_identity() {
        let mut n = normalizer();
        let s = n.normalize(RawSample {
            speed_ms: Some(10.0),
            ..RawSample::default()
        });

        assert_eq!(s.session_id, "test-session");
        assert_eq!(s.session_name, "Test Session");
        assert_eq!(s.data_source, SOURCE_REAL);
        assert_eq!(s.voltage_v, 0.0);
        assert_eq!(s.message_id, 0);
        assert!(DateTime::parse_from_rfc3339(&s.timestamp).is_ok());
    }

    #[test]
    fn recomputes_power_and_total_acceleration() {
        let mut n = normalizer();
        let s = n.normalize(RawSample {
            voltage_v: Some(48.0),
            current_a: Some(5.0),
            accel_x: Some(3.0),
            accel_y: Some(4.0),
            accel_z: Some(0.0),
            ..RawSample::default()
        });
        assert_relative_eq!(s.power_w, 240.0);
        assert_relative_eq!(s.total_acceleration, 5.0);
    }

    #[test]
    fn provided_power_is_kept() {
        let mut n = normalizer();
        let s = n.normalize(RawSample {
            voltage_v: Some(48.0),
            current_a: Some(5.0),
            power_w: Some(111.0),
            ..RawSample::default()
        });
        assert_relative_eq!(s.power_w, 111.0);
    }

    #[test]
    fn driver_inputs_reconcile_both_ways() {
        let mut n = normalizer();
        let s = n.normalize(RawSample {
            speed_ms: Some(5.0),
            throttle: Some(0.45),
            brake_pct: Some(30.0),
            ..RawSample::default()
        });
        assert!((s.throttle_pct - 45.0).abs() < 0.01);
        assert!((s.brake - 0.3).abs() < 0.01);
        // Consistency invariant after normalization.
        assert!((s.throttle_pct - 100.0 * s.throttle).abs() < 0.01);
        assert!((s.brake_pct - 100.0 * s.brake).abs() < 0.01);
    }

    #[test]
    fn zero_on_both_sides_stays_zero() {
        let mut n = normalizer();
        let s = n.normalize(RawSample {
            speed_ms: Some(5.0),
            throttle: Some(0.0),
            throttle_pct: Some(0.0),
            ..RawSample::default()
        });
        assert_eq!(s.throttle, 0.0);
        assert_eq!(s.throttle_pct, 0.0);
    }

    #[test]
    fn out_of_range_inputs_are_clamped_when_filling() {
        let mut n = normalizer();
        let s = n.normalize(RawSample {
            throttle: Some(1.8),
            brake_pct: Some(250.0),
            ..RawSample::default()
        });
        assert_relative_eq!(s.throttle_pct, 100.0);
        assert_relative_eq!(s.brake, 1.0);
    }

    #[test]
    fn epoch_zero_timestamp_is_replaced() {
        let mut n = normalizer();
        let s = n.normalize(RawSample {
            timestamp: Some("1970-01-01T00:00:00+00:00".into()),
            speed_ms: Some(1.0),
            ..RawSample::default()
        });
        assert!(!s.timestamp.starts_with("1970-01-01"));
    }

    #[test]
    fn valid_timestamp_is_canonicalized_to_utc() {
        let mut n = normalizer();
        let s = n.normalize(RawSample {
            timestamp: Some("2026-08-01T14:30:00+02:00".into()),
            speed_ms: Some(1.0),
            ..RawSample::default()
        });
        assert!(s.timestamp.starts_with("2026-08-01T12:30:00"));
        assert!(s.timestamp.ends_with('Z'));
    }

    #[test]
    fn naive_timestamp_is_taken_as_utc() {
        let mut n = normalizer();
        let s = n.normalize(RawSample {
            timestamp: Some("2026-08-01T12:00:00.5".into()),
            speed_ms: Some(1.0),
            ..RawSample::default()
        });
        assert!(s.timestamp.starts_with("2026-08-01T12:00:00.5"));
    }

    #[test]
    fn garbage_timestamp_is_replaced() {
        let mut n = normalizer();
        let s = n.normalize(RawSample {
            timestamp: Some("not-a-time".into()),
            speed_ms: Some(1.0),
            ..RawSample::default()
        });
        assert!(DateTime::parse_from_rfc3339(&s.timestamp).is_ok());
    }

    #[test]
    fn attaches_outlier_report_end_to_end() {
        let mut n = normalizer();
        let s = n.normalize(RawSample {
            voltage_v: Some(80.0),
            current_a: Some(5.0),
            speed_ms: Some(10.0),
            ..RawSample::default()
        });
        let report = s.outliers.expect("voltage bound should flag");
        assert_eq!(report.reasons["voltage_v"], OutlierReason::AbsoluteBound);
        assert_eq!(report.severity, OutlierSeverity::Critical);
        assert_eq!(n.outliers_detected(), 1);
        assert_eq!(n.detector_stats().critical, 1);
    }

    #[test]
    fn clean_sample_has_no_outlier_key() {
        let mut n = normalizer();
        let s = n.normalize(RawSample {
            voltage_v: Some(48.0),
            current_a: Some(7.5),
            speed_ms: Some(10.0),
            ..RawSample::default()
        });
        assert!(s.outliers.is_none());
        let json = serde_json::to_value(&s).unwrap();
        assert!(json.get("outliers").is_none());
    }

    #[test]
    fn derived_metrics_are_merged() {
        let mut n = normalizer();
        let s = n.normalize(RawSample {
            speed_ms: Some(12.0),
            voltage_v: Some(48.0),
            current_a: Some(7.5),
            ..RawSample::default()
        });
        assert_relative_eq!(s.derived.avg_speed_ms, 12.0);
        assert_relative_eq!(s.derived.max_speed_kmh, 43.2, epsilon = 1e-9);
    }
}
