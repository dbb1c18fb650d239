//! Database batch upload over the PostgREST endpoint.
//!
//! Inserts are at-least-once: the server is expected to be idempotent on
//! `(session_id, message_id)` or tolerate duplicates.

use anyhow::{bail, Context};
use serde_json::{json, Value};

use telemetry_types::TelemetrySample;

pub struct DbClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl DbClient {
    pub fn new(base_url: &str, api_key: &str, table: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .context("building database HTTP client")?;
        let endpoint = format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), table);
        Ok(Self {
            http,
            endpoint,
            api_key: api_key.to_string(),
        })
    }

    /// Insert one batch of records.
    pub async fn insert_batch(&self, records: &[TelemetrySample]) -> anyhow::Result<usize> {
        let rows: Vec<Value> = records.iter().map(db_row).collect();
        let response = self
            .http
            .post(&self.endpoint)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Prefer", "return=minimal")
            .json(&rows)
            .send()
            .await
            .context("sending insert batch")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("insert rejected ({status}): {body}");
        }
        Ok(records.len())
    }
}

/// Map a sample onto the table schema: `altitude` becomes `altitude_m`, and
/// the outlier report is carried as a JSON string when present.
pub fn db_row(s: &TelemetrySample) -> Value {
    json!({
        "session_id": s.session_id,
        "session_name": s.session_name,
        "timestamp": s.timestamp,
        "speed_ms": s.speed_ms,
        "voltage_v": s.voltage_v,
        "current_a": s.current_a,
        "power_w": s.power_w,
        "energy_j": s.energy_j,
        "distance_m": s.distance_m,
        "latitude": s.latitude,
        "longitude": s.longitude,
        "altitude_m": s.altitude,
        "gyro_x": s.gyro_x,
        "gyro_y": s.gyro_y,
        "gyro_z": s.gyro_z,
        "accel_x": s.accel_x,
        "accel_y": s.accel_y,
        "accel_z": s.accel_z,
        "total_acceleration": s.total_acceleration,
        "message_id": s.message_id,
        "uptime_seconds": s.uptime_seconds,
        "throttle_pct": s.throttle_pct,
        "brake_pct": s.brake_pct,
        "throttle": s.throttle,
        "brake": s.brake,
        "data_source": s.data_source,
        "outliers": s.outliers.as_ref().and_then(|o| serde_json::to_string(o).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use telemetry_types::{OutlierReason, OutlierReport, OutlierSeverity};

    #[test]
    fn row_renames_altitude_and_flattens_nothing_else() {
        let mut s = TelemetrySample::default();
        s.altitude = 123.5;
        s.session_id = "abc".into();

        let row = db_row(&s);
        assert_eq!(row["altitude_m"], 123.5);
        assert!(row.get("altitude").is_none());
        assert_eq!(row["session_id"], "abc");
        assert_eq!(row["outliers"], Value::Null);
    }

    #[test]
    fn outliers_serialize_as_json_string() {
        let mut s = TelemetrySample::default();
        s.outliers = Some(OutlierReport {
            flagged_fields: vec!["voltage_v".into()],
            confidence: BTreeMap::from([("voltage_v".into(), 1.0)]),
            reasons: BTreeMap::from([("voltage_v".into(), OutlierReason::AbsoluteBound)]),
            severity: OutlierSeverity::Critical,
        });

        let row = db_row(&s);
        let embedded = row["outliers"].as_str().expect("outliers should be a string");
        let parsed: OutlierReport = serde_json::from_str(embedded).unwrap();
        assert_eq!(parsed.severity, OutlierSeverity::Critical);
        assert!(embedded.contains("ABSOLUTE_BOUND"));
    }
}
